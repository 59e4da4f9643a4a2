//! Failure recovery: classification, adjusted retries, imports and
//! partial-apply plans

pub mod alternatives;
pub mod classify;
pub mod history;
pub mod partial;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::deploy::executor::partition_resources;
use crate::deploy::markers::{classify_phase, PhaseVerdict};
use crate::deploy::tracker::{DeploymentRequest, DeploymentTracker};
use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::models::deployment::{DeploymentRecord, DeploymentStatus, ImportedResource};
use crate::models::failure::{FailureKind, FailureRecord, ImportHint};
use crate::models::parameter::ParameterSet;
use crate::utils::{calc_exp_backoff, CooldownOptions};

use alternatives::AlternativePolicy;
use classify::import_candidates;
use history::FailureLog;
use partial::{plan_recovery, RecoveryPlan};

/// Written next to the record when a partial apply is planned
pub const RECOVERY_PLAN_FILE: &str = "recovery-plan.json";

/// What the coordinator did about a failed deployment
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// A new attempt with one parameter changed
    Retried {
        previous_id: String,
        new_id: String,
        kind: FailureKind,
        adjusted: ParameterSet,
        delay: Duration,
    },
    /// A new attempt with the same parameters that imports existing resources
    ImportRetried {
        previous_id: String,
        new_id: String,
        imports: Vec<ImportHint>,
    },
    /// Live resources need an operator; nothing was retried
    ManualCleanup(RecoveryPlan),
    /// Nothing automatic left to try
    ManualIntervention {
        deployment_id: String,
        working_directory: PathBuf,
        kind: FailureKind,
        reason: String,
    },
}

/// Recovery options
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Attempts along one `retry_of` chain, the first included
    pub max_attempts: u32,
    pub backoff: CooldownOptions,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(15),
                max_delay: Duration::from_secs(300),
                multiplier: 2.0,
            },
        }
    }
}

pub struct RecoveryCoordinator {
    tracker: Arc<DeploymentTracker>,
    log: Arc<FailureLog>,
    policy: AlternativePolicy,
    options: RecoveryOptions,
}

impl RecoveryCoordinator {
    pub fn new(
        tracker: Arc<DeploymentTracker>,
        log: Arc<FailureLog>,
        policy: AlternativePolicy,
        options: RecoveryOptions,
    ) -> Self {
        Self {
            tracker,
            log,
            policy,
            options,
        }
    }

    pub fn failure_log(&self) -> &Arc<FailureLog> {
        &self.log
    }

    /// Record a failed deployment in the history and decide what to do next.
    /// Partially failed deployments are never retried.
    pub async fn handle_failure(&self, deployment_id: &str) -> Result<RecoveryAction, AgentError> {
        let record = self.tracker.get_record(deployment_id).await?;
        match record.status {
            DeploymentStatus::Failed | DeploymentStatus::PartiallyFailed => {}
            status => {
                return Err(AgentError::InvalidTransition(format!(
                    "deployment {} is {}; only failed deployments are recovered",
                    deployment_id,
                    status.as_str()
                )))
            }
        }
        if let Some(next) = self
            .tracker
            .list_records()
            .into_iter()
            .find(|r| r.retry_of.as_deref() == Some(record.id.as_str()))
        {
            return Err(AgentError::InvalidTransition(format!(
                "deployment {} was already retried as {}",
                deployment_id, next.id
            )));
        }

        let kind = record.error_classification.unwrap_or(FailureKind::Unknown);
        self.remember(&record, kind).await?;

        if record.status == DeploymentStatus::PartiallyFailed {
            let plan = self.recover_partial(deployment_id).await?;
            warn!(
                "Deployment {} partially applied; {} resources live, {} need review",
                deployment_id,
                plan.matched.len(),
                plan.extras.len()
            );
            return Ok(RecoveryAction::ManualCleanup(plan));
        }

        if record.attempt >= self.options.max_attempts {
            return Ok(manual(
                &record,
                kind,
                format!("gave up after {} attempts", record.attempt),
            ));
        }

        if kind == FailureKind::NamingConflict {
            let imports: Vec<ImportHint> = import_candidates(&record.errors)
                .into_iter()
                .filter(|h| !record.is_imported(&h.address))
                .collect();
            if !imports.is_empty() {
                let parameters = self.tracker.parameters_of(deployment_id).await?;
                let request = DeploymentRequest {
                    template_id: record.template_id.clone(),
                    parameters,
                    imports: imports.clone(),
                    retry_of: Some(record.id.clone()),
                    delay: Duration::ZERO,
                };
                let new_id = self.tracker.start_request(request).await?;
                info!(
                    "Retrying {} as {} importing {} existing resources",
                    deployment_id,
                    new_id,
                    imports.len()
                );
                return Ok(RecoveryAction::ImportRetried {
                    previous_id: record.id.clone(),
                    new_id,
                    imports,
                });
            }
        }

        if !kind.is_retryable() {
            let reason = record
                .errors
                .first()
                .cloned()
                .or_else(|| record.message.clone())
                .unwrap_or_else(|| "unclassified failure".to_string());
            return Ok(manual(&record, kind, reason));
        }

        let parameters = self.tracker.parameters_of(deployment_id).await?;
        let template = self.tracker.template_of(&record).await?;
        let history = self.log.for_template(&record.template_id);
        let Some(adjusted) = self
            .policy
            .suggest_alternative(kind, &parameters, &history, &template)
        else {
            return Ok(manual(
                &record,
                kind,
                format!("no untried alternative for {}", kind.as_str()),
            ));
        };

        let delay = calc_exp_backoff(&self.options.backoff, record.attempt.saturating_sub(1));
        let request = DeploymentRequest {
            template_id: record.template_id.clone(),
            parameters: adjusted.clone(),
            imports: Vec::new(),
            retry_of: Some(record.id.clone()),
            delay,
        };
        let new_id = self.tracker.start_request(request).await?;
        info!(
            "Retrying {} ({}) as {} in {:?}",
            deployment_id,
            kind.as_str(),
            new_id,
            delay
        );
        Ok(RecoveryAction::Retried {
            previous_id: record.id.clone(),
            new_id,
            kind,
            adjusted,
            delay,
        })
    }

    /// Append to the history once per deployment
    async fn remember(&self, record: &DeploymentRecord, kind: FailureKind) -> Result<(), AgentError> {
        if !self.log.for_deployment(&record.id).is_empty() {
            return Ok(());
        }
        let reason = record
            .errors
            .first()
            .cloned()
            .or_else(|| record.message.clone())
            .unwrap_or_default();
        self.log
            .append(FailureRecord {
                deployment_id: record.id.clone(),
                template_id: record.template_id.clone(),
                attempted_parameters: record.parameters.clone(),
                fingerprint: record.fingerprint.clone(),
                kind,
                failure_reason: reason,
                timestamp: Utc::now(),
            })
            .await
    }

    /// Diff live resources against the template and refresh the record's
    /// resource lists. Nothing is deleted.
    pub async fn recover_partial(&self, deployment_id: &str) -> Result<RecoveryPlan, AgentError> {
        let guard = self.tracker.acquire(deployment_id).await?;
        let record = guard.record();
        let template = self.tracker.template_of(&record).await?;
        let listed = self
            .tracker
            .engine()
            .tool()
            .state_list(&record.working_directory)
            .await?;

        let plan = plan_recovery(
            &record.id,
            record.working_directory.clone(),
            &template,
            &record.imported,
            &listed,
        );
        let (resources, untracked) = partition_resources(&template, &record.imported, listed);
        guard
            .update(|r| {
                r.resources = resources;
                r.untracked_resources = untracked;
            })
            .await?;
        if !record.legacy {
            File::new(record.working_directory.join(RECOVERY_PLAN_FILE))
                .write_json(&plan)
                .await?;
        }
        Ok(plan)
    }

    /// Bind an existing cloud resource into a deployment's state
    pub async fn import_existing(
        &self,
        deployment_id: &str,
        address: &str,
        external_id: &str,
    ) -> Result<DeploymentRecord, AgentError> {
        let guard = self.tracker.acquire(deployment_id).await?;
        let record = guard.record();
        if record.legacy {
            return Err(AgentError::InvalidTransition(format!(
                "deployment {} predates records and is read-only",
                deployment_id
            )));
        }
        let template = self.tracker.template_of(&record).await?;
        if !template.declares(address) {
            return Err(AgentError::ConfigError(format!(
                "template {} does not declare {}",
                template.id, address
            )));
        }

        let dir = record.working_directory.as_path();
        let tool = self.tracker.engine().tool();
        guard
            .output()
            .push(format!("==> import {} {}", address, external_id))
            .await;

        if !dir.join(".terraform").exists() {
            let init = tool.init(dir, guard.output(), None).await?;
            if let PhaseVerdict::Failed { errors } = classify_phase(&init) {
                return Err(import_failure(deployment_id, "init", &errors));
            }
        }
        let out = tool.import(dir, address, external_id, guard.output()).await?;
        if let PhaseVerdict::Failed { errors } = classify_phase(&out) {
            return Err(import_failure(deployment_id, "import", &errors));
        }

        let mut imported = record.imported.clone();
        imported.push(ImportedResource {
            address: address.to_string(),
            external_id: external_id.to_string(),
            imported_at: Utc::now(),
        });
        let listed = tool.state_list(dir).await?;
        let (resources, untracked) = partition_resources(&template, &imported, listed);
        info!("Imported {} into deployment {}", address, deployment_id);

        guard
            .update(|r| {
                r.imported = imported;
                r.resources = resources;
                r.untracked_resources = untracked;
                r.message = Some(format!("imported {}", address));
                r.last_transition_at = Utc::now();
            })
            .await
    }
}

fn manual(record: &DeploymentRecord, kind: FailureKind, reason: String) -> RecoveryAction {
    warn!(
        "Deployment {} needs manual intervention: {}",
        record.id, reason
    );
    RecoveryAction::ManualIntervention {
        deployment_id: record.id.clone(),
        working_directory: record.working_directory.clone(),
        kind,
        reason,
    }
}

fn import_failure(deployment_id: &str, step: &str, errors: &[String]) -> AgentError {
    AgentError::ExecutionError {
        deployment_id: deployment_id.to_string(),
        message: format!(
            "{} failed: {}",
            step,
            errors.first().map(String::as_str).unwrap_or("unknown error")
        ),
        retryable: false,
    }
}
