//! Execution engine: init, imports, plan and apply inside a working directory

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::deploy::markers::{classify_phase, PhaseVerdict};
use crate::deploy::output::OutputBuffer;
use crate::deploy::tool::{CancelSignal, Phase, PhaseOutput, ProvisioningTool};
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::models::deployment::ImportedResource;
use crate::models::failure::ImportHint;
use crate::models::parameter::ParameterSet;
use crate::registry::{TEMPLATE_FILE, VARIABLES_FILE};
use crate::templates::{base_address, is_data_source, Template};

/// Everything one run needs
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub deployment_id: String,
    pub working_directory: PathBuf,
    pub template: Template,
    pub parameters: ParameterSet,
    /// Bound into state between init and plan
    pub imports: Vec<ImportHint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// Nothing is live
    Failed,
    /// Apply stopped with live resources
    PartiallyFailed,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub deployment_id: String,
    pub outcome: ExecutionOutcome,
    pub failed_phase: Option<Phase>,
    /// Apply reported nothing to do
    pub no_changes: bool,
    pub cancelled: bool,
    pub errors: Vec<String>,
    /// Declared-or-imported addresses the tool reports as managed
    pub resources: Vec<String>,
    /// Managed by the tool but neither declared nor imported
    pub untracked: Vec<String>,
    pub imported: Vec<ImportedResource>,
    /// `output -json`, captured on success
    pub outputs: Option<Value>,
}

impl ExecutionResult {
    fn new(deployment_id: &str, outcome: ExecutionOutcome) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            outcome,
            failed_phase: None,
            no_changes: false,
            cancelled: false,
            errors: Vec::new(),
            resources: Vec::new(),
            untracked: Vec::new(),
            imported: Vec::new(),
            outputs: None,
        }
    }

    fn failed(deployment_id: &str, phase: Phase, errors: Vec<String>) -> Self {
        let mut result = Self::new(deployment_id, ExecutionOutcome::Failed);
        result.failed_phase = Some(phase);
        result.errors = errors;
        result
    }

    fn cancelled(deployment_id: &str, phase: Phase) -> Self {
        let mut result = Self::failed(
            deployment_id,
            phase,
            vec!["cancelled before apply".to_string()],
        );
        result.cancelled = true;
        result
    }

    /// All error text, for classification
    pub fn error_text(&self) -> String {
        self.errors.join("\n")
    }
}

/// Observes phase entry. Returning `false` stops the run before the phase
/// starts; past the apply boundary the engine no longer asks.
#[async_trait]
pub trait PhaseListener: Send + Sync {
    async fn entering(&self, phase: Phase) -> Result<bool, AgentError>;
}

/// Listener that lets every phase run
pub struct NoopListener;

#[async_trait]
impl PhaseListener for NoopListener {
    async fn entering(&self, _phase: Phase) -> Result<bool, AgentError> {
        Ok(true)
    }
}

pub struct ExecutionEngine {
    tool: Arc<dyn ProvisioningTool>,
}

impl ExecutionEngine {
    pub fn new(tool: Arc<dyn ProvisioningTool>) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> &Arc<dyn ProvisioningTool> {
        &self.tool
    }

    /// Write the template and variables files
    pub async fn prepare(&self, request: &ExecutionRequest) -> Result<(), AgentError> {
        let dir = Dir::new(&request.working_directory);
        dir.create().await?;
        dir.file(TEMPLATE_FILE)
            .write_atomic(request.template.content.as_bytes())
            .await?;

        // Holds secret values
        let variables = dir.file(VARIABLES_FILE);
        let content = serde_json::to_string_pretty(&request.parameters.to_tfvars_json())?;
        variables.write_atomic(content.as_bytes()).await?;
        variables.set_permissions_600().await?;
        Ok(())
    }

    /// Run every phase in order. Expected failures are reported in the
    /// result; only I/O and state problems are errors.
    pub async fn run(
        &self,
        request: &ExecutionRequest,
        output: &OutputBuffer,
        listener: &dyn PhaseListener,
        cancel: Option<CancelSignal>,
    ) -> Result<ExecutionResult, AgentError> {
        let id = request.deployment_id.as_str();
        let dir = request.working_directory.as_path();
        info!("Executing deployment {} in {}", id, dir.display());

        self.prepare(request).await?;

        // init
        if !listener.entering(Phase::Init).await? {
            return Ok(ExecutionResult::cancelled(id, Phase::Init));
        }
        header(output, Phase::Init).await;
        let init = self.tool.init(dir, output, cancel.clone()).await?;
        if let Some(result) = stop_on_failure(id, &init) {
            return Ok(result);
        }

        // imports
        let mut imported = Vec::new();
        for hint in &request.imports {
            if !listener.entering(Phase::Import).await? {
                return Ok(ExecutionResult::cancelled(id, Phase::Import));
            }
            header(output, Phase::Import).await;
            let out = self
                .tool
                .import(dir, &hint.address, &hint.external_id, output)
                .await?;
            let already_managed = out
                .text_lines()
                .any(|l| l.contains("Resource already managed"));
            if !already_managed {
                if let Some(result) = stop_on_failure(id, &out) {
                    return Ok(result);
                }
            }
            info!("Imported {} as {} into {}", hint.external_id, hint.address, id);
            imported.push(ImportedResource {
                address: hint.address.clone(),
                external_id: hint.external_id.clone(),
                imported_at: Utc::now(),
            });
        }

        // plan
        if !listener.entering(Phase::Plan).await? {
            return Ok(ExecutionResult::cancelled(id, Phase::Plan));
        }
        header(output, Phase::Plan).await;
        let plan = self.tool.plan(dir, output, cancel.clone()).await?;
        if let Some(mut result) = stop_on_failure(id, &plan) {
            result.imported = imported;
            return Ok(result);
        }

        // apply boundary
        if !listener.entering(Phase::Apply).await? {
            let mut result = ExecutionResult::cancelled(id, Phase::Apply);
            result.imported = imported;
            return Ok(result);
        }
        header(output, Phase::Apply).await;
        let apply = self.tool.apply(dir, output).await?;
        let verdict = classify_phase(&apply);

        let (resources, untracked) = self.tracked_resources(request, &imported).await?;
        if !untracked.is_empty() {
            warn!(
                "Deployment {} has untracked resources in state: {:?}",
                id, untracked
            );
        }

        let mut result = match verdict {
            PhaseVerdict::Succeeded { no_changes, .. } => {
                let mut result = ExecutionResult::new(id, ExecutionOutcome::Completed);
                result.no_changes = no_changes;
                result.outputs = match self.tool.outputs(dir).await {
                    Ok(outputs) => Some(outputs),
                    Err(e) => {
                        warn!("Failed to read outputs of {}: {}", id, e);
                        None
                    }
                };
                info!("Deployment {} applied ({} resources)", id, resources.len());
                result
            }
            PhaseVerdict::Failed { errors } => {
                let outcome = if resources.is_empty() && untracked.is_empty() {
                    ExecutionOutcome::Failed
                } else {
                    ExecutionOutcome::PartiallyFailed
                };
                error!("Deployment {} apply failed: {:?}", id, outcome);
                let mut result = ExecutionResult::new(id, outcome);
                result.failed_phase = Some(Phase::Apply);
                result.errors = errors;
                result
            }
        };
        result.resources = resources;
        result.untracked = untracked;
        result.imported = imported;
        Ok(result)
    }

    /// Split the tool's state list into declared-or-imported and untracked
    pub async fn tracked_resources(
        &self,
        request: &ExecutionRequest,
        imported: &[ImportedResource],
    ) -> Result<(Vec<String>, Vec<String>), AgentError> {
        let listed = self.tool.state_list(&request.working_directory).await?;
        Ok(partition_resources(&request.template, imported, listed))
    }
}

/// Data sources are dropped; the rest is split by whether the template
/// declares it or it was imported
pub fn partition_resources(
    template: &Template,
    imported: &[ImportedResource],
    listed: Vec<String>,
) -> (Vec<String>, Vec<String>) {
    let mut tracked = Vec::new();
    let mut untracked = Vec::new();
    for address in listed.into_iter().filter(|a| !is_data_source(a)) {
        let base = base_address(&address);
        let was_imported = imported
            .iter()
            .any(|i| i.address == address || base_address(&i.address) == base);
        if template.declares(&address) || was_imported {
            tracked.push(address);
        } else {
            untracked.push(address);
        }
    }
    (tracked, untracked)
}

async fn header(output: &OutputBuffer, phase: Phase) {
    output.push(format!("==> {}", phase.as_str())).await;
}

fn stop_on_failure(id: &str, out: &PhaseOutput) -> Option<ExecutionResult> {
    match classify_phase(out) {
        PhaseVerdict::Succeeded { .. } => {
            debug!("Deployment {} {} succeeded", id, out.phase.as_str());
            None
        }
        PhaseVerdict::Failed { .. } if out.cancelled => {
            info!("Deployment {} cancelled during {}", id, out.phase.as_str());
            Some(ExecutionResult::cancelled(id, out.phase))
        }
        PhaseVerdict::Failed { errors } => {
            warn!("Deployment {} {} failed", id, out.phase.as_str());
            Some(ExecutionResult::failed(id, out.phase, errors))
        }
    }
}
