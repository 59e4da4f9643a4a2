//! Recovery plans for partially applied deployments

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::deployment::ImportedResource;
use crate::templates::{base_address, is_data_source, Template};

/// Diff of what the tool manages against what the template intends.
/// Nothing in a plan is ever deleted automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub deployment_id: String,
    pub working_directory: PathBuf,
    /// Live and declared (or imported); left alone
    pub matched: Vec<String>,
    /// Declared but not live
    pub missing: Vec<String>,
    /// Live but neither declared nor imported; for operator review
    pub extras: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl RecoveryPlan {
    pub fn needs_review(&self) -> bool {
        !self.extras.is_empty()
    }

    /// Operator-facing steps
    pub fn steps(&self) -> Vec<String> {
        let mut steps = Vec::new();
        if !self.matched.is_empty() {
            steps.push(format!(
                "{} resources are live and managed; re-apply or destroy deployment {} to settle them",
                self.matched.len(),
                self.deployment_id
            ));
        }
        if !self.missing.is_empty() {
            steps.push(format!(
                "not created: {}",
                self.missing.join(", ")
            ));
        }
        for extra in &self.extras {
            steps.push(format!(
                "review {} in {}: not declared by the template",
                extra,
                self.working_directory.display()
            ));
        }
        steps
    }
}

/// Build a plan from the tool's authoritative resource list
pub fn plan_recovery(
    deployment_id: &str,
    working_directory: PathBuf,
    template: &Template,
    imported: &[ImportedResource],
    listed: &[String],
) -> RecoveryPlan {
    let live: Vec<&String> = listed.iter().filter(|a| !is_data_source(a)).collect();

    let mut matched = Vec::new();
    let mut extras = Vec::new();
    for address in &live {
        let base = base_address(address);
        let was_imported = imported.iter().any(|i| base_address(&i.address) == base);
        if template.declares(address) || was_imported {
            matched.push(address.to_string());
        } else {
            extras.push(address.to_string());
        }
    }

    let missing = template
        .resources
        .iter()
        .filter(|declared| {
            !live.iter().any(|address| {
                let base = base_address(address);
                if declared.starts_with("module.") {
                    base == **declared || base.starts_with(&format!("{}.", declared))
                } else {
                    base == **declared
                }
            })
        })
        .cloned()
        .collect();

    RecoveryPlan {
        deployment_id: deployment_id.to_string(),
        working_directory,
        matched,
        missing,
        extras,
        created_at: Utc::now(),
    }
}
