//! Failure classification from tool error text

use std::sync::LazyLock;

use regex::Regex;

use crate::deploy::executor::{ExecutionOutcome, ExecutionResult};
use crate::models::failure::{FailureKind, ImportHint};

static QUOTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)quota|limitexceeded|exceeds? (the )?(approved |regional )?limit|operation could not be completed as it results in exceeding",
    )
    .expect("quota regex")
});
static CAPACITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)skunotavailable|allocationfailed|overconstrainedallocationrequest|insufficient\w*capacity|resource_pool_exhausted|(size|sku) .*(is )?(currently )?not available in (location|region|zone)|capacity (is )?(constrained|unavailable)",
    )
    .expect("capacity regex")
});
static NAMING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)already exists|alreadyexists|already taken|alreadytaken|already in use|alreadyinuse|namenotavailable|name is not available|is already being used",
    )
    .expect("naming regex")
});
static IMPORT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"A resource with the ID "([^"]+)" already exists - to be managed via Terraform"#)
        .expect("import id regex")
});
static WITH_ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*with ([A-Za-z0-9_.\-\[\]"]+),\s*$"#).expect("with address regex")
});

/// Kind of an execution failure
pub fn classify(result: &ExecutionResult) -> FailureKind {
    if result.outcome == ExecutionOutcome::PartiallyFailed {
        return FailureKind::PartialApply;
    }
    classify_text(&result.error_text())
}

/// Kind by error text alone. Quota is checked before capacity, capacity
/// before naming: quota messages often mention the size that hit the limit.
pub fn classify_text(text: &str) -> FailureKind {
    if QUOTA_RE.is_match(text) {
        FailureKind::QuotaExceeded
    } else if CAPACITY_RE.is_match(text) {
        FailureKind::CapacityConstraint
    } else if NAMING_RE.is_match(text) {
        FailureKind::NamingConflict
    } else {
        FailureKind::Unknown
    }
}

/// Resources the tool refused to create because they already exist and
/// should be imported instead
pub fn import_candidates(errors: &[String]) -> Vec<ImportHint> {
    let mut hints: Vec<ImportHint> = Vec::new();
    for block in errors {
        let Some(id) = IMPORT_ID_RE.captures(block).map(|c| c[1].to_string()) else {
            continue;
        };
        let Some(address) = WITH_ADDRESS_RE.captures(block).map(|c| c[1].to_string()) else {
            continue;
        };
        if !hints.iter().any(|h| h.address == address) {
            hints.push(ImportHint {
                address,
                external_id: id,
            });
        }
    }
    hints
}
