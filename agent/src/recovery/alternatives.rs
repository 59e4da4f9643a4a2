//! Adjusted parameter sets for retryable failures

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::models::failure::{FailureKind, FailureRecord};
use crate::models::parameter::{ParamValue, ParameterDefinition, ParameterSet};
use crate::storage::settings::RecoverySettings;
use crate::templates::Template;

/// Naming retries try suffixes up to this number
const MAX_NAME_SUFFIX: u32 = 9;

/// Which parameters each failure kind may change, and to what
#[derive(Debug, Clone)]
pub struct AlternativePolicy {
    preferences: BTreeMap<String, Vec<String>>,
    capacity_params: Vec<String>,
    quota_params: Vec<String>,
    naming_params: Vec<String>,
}

impl From<&RecoverySettings> for AlternativePolicy {
    fn from(settings: &RecoverySettings) -> Self {
        Self {
            preferences: settings.preferences.clone(),
            capacity_params: settings.capacity_params.clone(),
            quota_params: settings.quota_params.clone(),
            naming_params: settings.naming_params.clone(),
        }
    }
}

impl AlternativePolicy {
    /// A copy of `parameters` with one parameter changed, or `None` when
    /// every alternative was already tried. Values present in a same-kind
    /// failure of the history are never suggested, nor is any combination
    /// whose fingerprint already failed.
    pub fn suggest_alternative(
        &self,
        kind: FailureKind,
        parameters: &ParameterSet,
        history: &[FailureRecord],
        template: &Template,
    ) -> Option<ParameterSet> {
        let adjustable = match kind {
            FailureKind::CapacityConstraint => &self.capacity_params,
            FailureKind::QuotaExceeded => &self.quota_params,
            FailureKind::NamingConflict => &self.naming_params,
            FailureKind::PartialApply | FailureKind::Unknown => return None,
        };

        for name in adjustable {
            let Some(current) = parameters.get(name).and_then(ParamValue::as_text) else {
                continue;
            };
            let definition = template.definition(name);
            let failed: Vec<&str> = history
                .iter()
                .filter(|r| r.kind == kind)
                .filter_map(|r| r.value_of(name).and_then(Value::as_str))
                .collect();

            let options = match kind {
                FailureKind::NamingConflict => name_variants(current),
                _ => self.preferences.get(name).cloned().unwrap_or_default(),
            };

            for option in options {
                if option.eq_ignore_ascii_case(current)
                    || failed.iter().any(|f| f.eq_ignore_ascii_case(&option))
                    || !accepts(definition, &option)
                {
                    continue;
                }
                let mut adjusted = parameters.clone();
                adjusted.insert(name.clone(), ParamValue::text(option.clone()));
                let fingerprint = adjusted.fingerprint(&template.id);
                if history.iter().any(|r| r.fingerprint == fingerprint) {
                    continue;
                }
                debug!("Suggesting {}={} after {}", name, option, kind.as_str());
                return Some(adjusted);
            }
        }
        None
    }
}

/// `base-2`, `base-3`, ... with any earlier numeric suffix replaced, then the
/// same without separators for names that only allow alphanumerics
fn name_variants(current: &str) -> Vec<String> {
    let base = match current.rsplit_once('-') {
        Some((head, tail)) if !head.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) => head,
        _ => current,
    };
    let mut variants: Vec<String> = (2..=MAX_NAME_SUFFIX)
        .map(|n| format!("{}-{}", base, n))
        .collect();
    let compact: String = base.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    variants.extend((2..=MAX_NAME_SUFFIX).map(|n| format!("{}{}", compact, n)));
    variants
}

fn accepts(definition: Option<&ParameterDefinition>, value: &str) -> bool {
    let Some(definition) = definition else {
        return true;
    };
    if let Some(allowed) = &definition.allowed_values {
        if !allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
            return false;
        }
    }
    if let Some(pattern) = &definition.validation_pattern {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(value) => {}
            _ => return false,
        }
    }
    true
}
