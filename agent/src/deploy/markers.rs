//! Phase outcome classification from tool output markers.
//!
//! The exit code alone is not trusted: the tool can exit non-zero after
//! creating resources, and zero after printing errors it chose to ignore.

use std::sync::LazyLock;

use regex::Regex;

use crate::deploy::tool::{Phase, PhaseOutput};

static PLAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Plan: \d+ to add").expect("plan regex"));
static APPLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Apply complete! Resources: (\d+) added, (\d+) changed, (\d+) destroyed")
        .expect("apply regex")
});

const NO_CHANGES: &str = "No changes.";
const UP_TO_DATE: &str = "Infrastructure is up-to-date";

/// Lines a single error block may span
const MAX_ERROR_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplySummary {
    pub added: u32,
    pub changed: u32,
    pub destroyed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseVerdict {
    Succeeded {
        no_changes: bool,
        summary: Option<ApplySummary>,
    },
    Failed {
        errors: Vec<String>,
    },
}

impl PhaseVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, PhaseVerdict::Succeeded { .. })
    }
}

/// Drop the box-drawing gutter the tool draws around diagnostics
fn strip_gutter(line: &str) -> &str {
    line.trim_start_matches(['│', '╷', '╵', ' ', '\t'])
}

/// Error blocks, each starting at an `Error:` line
pub fn extract_errors<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut errors = Vec::new();
    let mut current: Option<Vec<String>> = None;

    for raw in lines {
        let closes_box = raw.trim_start().starts_with('╵');
        let line = strip_gutter(raw).trim_end();

        if line.starts_with("Error:") {
            if let Some(block) = current.take() {
                errors.push(block.join("\n").trim().to_string());
            }
            current = Some(vec![line.to_string()]);
            continue;
        }
        if let Some(block) = current.as_mut() {
            if closes_box || block.len() >= MAX_ERROR_LINES {
                errors.push(block.join("\n").trim().to_string());
                current = None;
            } else {
                block.push(line.to_string());
            }
        }
    }
    if let Some(block) = current {
        errors.push(block.join("\n").trim().to_string());
    }
    errors
}

fn success_marker(phase: Phase, output: &PhaseOutput) -> Option<(bool, Option<ApplySummary>)> {
    let mut found = None;
    for line in output.text_lines() {
        let line = strip_gutter(line);
        let hit = match phase {
            Phase::Init => line
                .contains("has been successfully initialized")
                .then_some((false, None)),
            Phase::Import => line.contains("Import successful").then_some((false, None)),
            Phase::Plan if line.contains(NO_CHANGES) => Some((true, None)),
            Phase::Plan => PLAN_RE.is_match(line).then_some((false, None)),
            Phase::Apply if line.contains(NO_CHANGES) || line.contains(UP_TO_DATE) => {
                Some((true, None))
            }
            Phase::Apply => APPLY_RE.captures(line).map(|caps| {
                let summary = ApplySummary {
                    added: caps[1].parse().unwrap_or(0),
                    changed: caps[2].parse().unwrap_or(0),
                    destroyed: caps[3].parse().unwrap_or(0),
                };
                (summary == ApplySummary::default(), Some(summary))
            }),
            Phase::Destroy => line.contains("Destroy complete!").then_some((false, None)),
            Phase::StateList | Phase::Output => None,
        };
        if hit.is_some() {
            found = hit;
        }
    }
    found
}

/// Success = the phase's marker and no error marker
pub fn classify_phase(output: &PhaseOutput) -> PhaseVerdict {
    if output.cancelled {
        return PhaseVerdict::Failed {
            errors: vec![format!("{} cancelled", output.phase.as_str())],
        };
    }

    let errors = extract_errors(output.text_lines());
    if !errors.is_empty() {
        return PhaseVerdict::Failed { errors };
    }

    if matches!(output.phase, Phase::StateList | Phase::Output) {
        if output.exited_cleanly() {
            return PhaseVerdict::Succeeded {
                no_changes: false,
                summary: None,
            };
        }
    } else if let Some((no_changes, summary)) = success_marker(output.phase, output) {
        return PhaseVerdict::Succeeded {
            no_changes,
            summary,
        };
    }

    PhaseVerdict::Failed {
        errors: vec![format!(
            "{} exited with status {} without a completion marker",
            output.phase.as_str(),
            output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        )],
    }
}
