//! Deployment tracker: background execution with non-blocking status polls

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::discovery::ClusterDiscoveryService;
use crate::deploy::executor::{
    partition_resources, ExecutionEngine, ExecutionOutcome, ExecutionRequest, ExecutionResult,
    PhaseListener,
};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use crate::deploy::markers::classify_phase;
use crate::deploy::output::OutputBuffer;
use crate::deploy::state::StateSnapshot;
use crate::deploy::tool::Phase;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::{DeploymentRecord, DeploymentStatus, ProgressPhase};
use crate::models::failure::{FailureKind, ImportHint};
use crate::models::parameter::ParameterSet;
use crate::recovery::classify::classify;
use crate::registry::{
    DirectoryRegistry, LOCK_FILE, OUTPUT_LOG, RECORD_FILE, TEMPLATE_FILE, VARIABLES_FILE,
};
use crate::templates::{parse_template, Template, TemplateCatalog};
use crate::utils::generate_id;

/// Tracker options
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Callers are told to stop polling a running deployment after this long
    pub poll_ceiling: Duration,
    /// Output lines returned by `poll_status`
    pub tail_lines: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            poll_ceiling: Duration::from_secs(45 * 60),
            tail_lines: 40,
        }
    }
}

/// A request to deploy a template
#[derive(Debug, Clone, Default)]
pub struct DeploymentRequest {
    pub template_id: String,
    pub parameters: ParameterSet,
    pub imports: Vec<ImportHint>,
    /// Previous attempt this one retries
    pub retry_of: Option<String>,
    /// Wait before the worker starts; cancellable
    pub delay: Duration,
}

impl DeploymentRequest {
    pub fn new(template_id: impl Into<String>, parameters: ParameterSet) -> Self {
        Self {
            template_id: template_id.into(),
            parameters,
            ..Default::default()
        }
    }
}

/// What a poll returns
#[derive(Debug, Clone, PartialEq)]
pub struct StatusView {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub phase: ProgressPhase,
    pub message: Option<String>,
    pub output_tail: Vec<String>,
    /// Cursor for `poll_since`
    pub cursor: u64,
    /// Set once terminal
    pub resources_created: Option<Vec<String>>,
    pub untracked_resources: Vec<String>,
    pub error_classification: Option<FailureKind>,
    pub working_directory: PathBuf,
    pub retry_of: Option<String>,
    pub attempt: u32,
    /// False once terminal or past the polling ceiling
    pub keep_polling: bool,
}

struct DeploymentEntry {
    record: RwLock<DeploymentRecord>,
    /// Held across every transition; the apply boundary is crossed under it
    fsm: Mutex<DeploymentFsm>,
    output: Arc<OutputBuffer>,
    cancel: watch::Sender<bool>,
    busy: AtomicBool,
}

impl DeploymentEntry {
    fn new(record: DeploymentRecord, output: OutputBuffer) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            fsm: Mutex::new(DeploymentFsm::from_status(record.status)),
            record: RwLock::new(record),
            output: Arc::new(output),
            cancel,
            busy: AtomicBool::new(false),
        })
    }

    fn snapshot(&self) -> DeploymentRecord {
        self.record.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply `update` and persist the record atomically
    async fn update(
        &self,
        update: impl FnOnce(&mut DeploymentRecord),
    ) -> Result<DeploymentRecord, AgentError> {
        let snapshot = {
            let mut record = self.record.write().unwrap_or_else(|e| e.into_inner());
            update(&mut record);
            record.clone()
        };
        if !snapshot.legacy {
            File::new(snapshot.working_directory.join(RECORD_FILE))
                .write_json(&snapshot)
                .await?;
        }
        Ok(snapshot)
    }
}

pub struct DeploymentTracker {
    options: TrackerOptions,
    registry: Arc<DirectoryRegistry>,
    catalog: Arc<dyn TemplateCatalog>,
    engine: Arc<ExecutionEngine>,
    discovery: Option<Arc<ClusterDiscoveryService>>,
    entries: RwLock<HashMap<String, Arc<DeploymentEntry>>>,
    /// Held from the fingerprint check until the new entry is visible
    start_lock: Mutex<()>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl DeploymentTracker {
    pub fn new(
        options: TrackerOptions,
        registry: Arc<DirectoryRegistry>,
        catalog: Arc<dyn TemplateCatalog>,
        engine: Arc<ExecutionEngine>,
        discovery: Option<Arc<ClusterDiscoveryService>>,
    ) -> Self {
        Self {
            options,
            registry,
            catalog,
            engine,
            discovery,
            entries: RwLock::new(HashMap::new()),
            start_lock: Mutex::new(()),
            workers: std::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn TemplateCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<DirectoryRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Allocate a record and start executing in the background
    pub async fn start_async(
        self: &Arc<Self>,
        template_id: &str,
        parameters: ParameterSet,
    ) -> Result<String, AgentError> {
        self.start_request(DeploymentRequest::new(template_id, parameters))
            .await
    }

    pub async fn start_request(
        self: &Arc<Self>,
        request: DeploymentRequest,
    ) -> Result<String, AgentError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AgentError::ShutdownError(
                "tracker is shutting down".to_string(),
            ));
        }

        let template = self.catalog.get(&request.template_id).await?;
        let parameters = resolve_parameters(&template, &request.parameters)?;
        let fingerprint = parameters.fingerprint(&template.id);

        let reservation = self.start_lock.lock().await;
        // Retries and imports always get their own record
        if request.imports.is_empty() && request.retry_of.is_none() {
            if let Some(existing) = self.find_by_fingerprint(&template.id, &fingerprint) {
                info!(
                    "Deployment {} already covers template {} with these parameters",
                    existing, template.id
                );
                return Ok(existing);
            }
        }

        let attempt = match &request.retry_of {
            Some(previous) => self.get_record(previous).await?.attempt + 1,
            None => 1,
        };

        let id = generate_id("dep");
        let dir = self.registry.assign(&id).await?;
        let mut record = DeploymentRecord::new(
            id.clone(),
            dir.clone(),
            template.id.clone(),
            parameters.redacted(),
            fingerprint,
        );
        record.retry_of = request.retry_of.clone();
        record.attempt = attempt;

        let output = OutputBuffer::open(File::new(dir.join(OUTPUT_LOG))).await?;
        let entry = DeploymentEntry::new(record, output);
        entry.update(|_| {}).await?;
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(id.clone(), entry.clone());
        }
        drop(reservation);
        info!(
            "Started deployment {} of template {} (attempt {})",
            id, template.id, attempt
        );

        let execution = ExecutionRequest {
            deployment_id: id.clone(),
            working_directory: dir,
            template,
            parameters,
            imports: request.imports,
        };
        self.spawn_execution(entry, execution, request.delay);
        Ok(id)
    }

    fn find_by_fingerprint(&self, template_id: &str, fingerprint: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .map(|e| e.snapshot())
            .filter(|r| r.template_id == template_id && r.fingerprint == fingerprint)
            .filter(|r| {
                matches!(
                    r.status,
                    DeploymentStatus::Pending
                        | DeploymentStatus::Planning
                        | DeploymentStatus::Applying
                        | DeploymentStatus::Completed
                )
            })
            .min_by_key(|r| r.created_at)
            .map(|r| r.id)
    }

    fn spawn_execution(
        self: &Arc<Self>,
        entry: Arc<DeploymentEntry>,
        request: ExecutionRequest,
        delay: Duration,
    ) {
        entry.busy.store(true, Ordering::SeqCst);
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            let id = request.deployment_id.clone();
            if let Err(e) = tracker.execute(&entry, request, delay).await {
                error!("Deployment {} worker failed: {}", id, e);
            }
            entry.busy.store(false, Ordering::SeqCst);
        });
        self.track_worker(handle);
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    async fn execute(
        &self,
        entry: &Arc<DeploymentEntry>,
        request: ExecutionRequest,
        delay: Duration,
    ) -> Result<(), AgentError> {
        let mut cancel = entry.cancel.subscribe();
        if !delay.is_zero() {
            debug!("Deployment {} starts in {:?}", request.deployment_id, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.wait_for(|c| *c) => {}
            }
        }

        {
            let mut fsm = entry.fsm.lock().await;
            if fsm.state().is_terminal() {
                return Ok(());
            }
            let status = fsm.process(DeploymentEvent::Begin)?;
            entry
                .update(|r| {
                    r.status = status;
                    r.phase = ProgressPhase::Init;
                    r.last_transition_at = Utc::now();
                })
                .await?;
        }

        let listener = TrackerListener {
            entry: entry.clone(),
        };
        let result = self
            .engine
            .run(&request, &entry.output, &listener, Some(cancel))
            .await;
        self.finish(entry, &request, result).await
    }

    async fn finish(
        &self,
        entry: &Arc<DeploymentEntry>,
        request: &ExecutionRequest,
        result: Result<ExecutionResult, AgentError>,
    ) -> Result<(), AgentError> {
        let mut fsm = entry.fsm.lock().await;
        if fsm.state().is_terminal() {
            // Cancelled while the engine was stopping
            return Ok(());
        }

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                error!("Deployment {} aborted: {}", request.deployment_id, e);
                let message = e.to_string();
                let event = if fsm.state() == DeploymentStatus::Applying {
                    DeploymentEvent::PartiallyFailed(message.clone())
                } else {
                    DeploymentEvent::Failed(message.clone())
                };
                let status = fsm.process(event)?;
                entry
                    .update(|r| {
                        r.status = status;
                        r.phase = ProgressPhase::Done;
                        r.last_transition_at = Utc::now();
                        r.message = Some(message.clone());
                        r.errors = vec![message];
                        r.error_classification = Some(if status == DeploymentStatus::PartiallyFailed {
                            FailureKind::PartialApply
                        } else {
                            FailureKind::Unknown
                        });
                    })
                    .await?;
                return Ok(());
            }
        };

        let (event, message) = match result.outcome {
            ExecutionOutcome::Completed => {
                let message = if result.no_changes {
                    "Apply complete, no changes".to_string()
                } else {
                    format!("Apply complete, {} resources", result.resources.len())
                };
                (DeploymentEvent::Succeeded, message)
            }
            ExecutionOutcome::Failed => {
                let message = format!(
                    "{} failed: {}",
                    result.failed_phase.map(|p| p.as_str()).unwrap_or("execution"),
                    result.errors.first().map(String::as_str).unwrap_or("unknown error")
                );
                (DeploymentEvent::Failed(message.clone()), message)
            }
            ExecutionOutcome::PartiallyFailed => {
                let message = format!(
                    "apply stopped with {} live resources: {}",
                    result.resources.len(),
                    result.errors.first().map(String::as_str).unwrap_or("unknown error")
                );
                (DeploymentEvent::PartiallyFailed(message.clone()), message)
            }
        };
        let status = fsm.process(event)?;
        let classification = (status != DeploymentStatus::Completed).then(|| classify(&result));
        let record = entry
            .update(|r| {
                r.status = status;
                r.phase = ProgressPhase::Done;
                r.last_transition_at = Utc::now();
                r.message = Some(message);
                r.errors = result.errors.clone();
                r.resources = result.resources.clone();
                r.untracked_resources = result.untracked.clone();
                r.imported.extend(result.imported.iter().cloned());
                r.error_classification = classification;
            })
            .await?;
        drop(fsm);
        info!("Deployment {} is {}", record.id, status.as_str());

        if status == DeploymentStatus::Completed {
            self.register_cluster(entry, &record, result.outputs.as_ref())
                .await;
        }
        Ok(())
    }

    async fn register_cluster(
        &self,
        entry: &Arc<DeploymentEntry>,
        record: &DeploymentRecord,
        outputs: Option<&serde_json::Value>,
    ) {
        let Some(discovery) = &self.discovery else {
            return;
        };
        match discovery.register(record, outputs).await {
            Ok(Some(summary)) => {
                if let Err(e) = entry.update(|r| r.cluster = Some(summary)).await {
                    warn!("Failed to record cluster of {}: {}", record.id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to register cluster of {}: {}", record.id, e),
        }
    }

    fn entry(&self, deployment_id: &str) -> Option<Arc<DeploymentEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(deployment_id).cloned()
    }

    /// Entry in memory, or loaded from wherever the registry finds it
    async fn entry_or_load(&self, deployment_id: &str) -> Result<Arc<DeploymentEntry>, AgentError> {
        if let Some(entry) = self.entry(deployment_id) {
            return Ok(entry);
        }
        let dir = self
            .registry
            .find(deployment_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("deployment {}", deployment_id)))?;

        // A loose match resolves to the directory's own id; never open a
        // second entry for a deployment that is already live
        let dir_id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .ok_or_else(|| AgentError::NotFound(format!("deployment {}", deployment_id)))?;
        if let Some(entry) = self.entry(&dir_id) {
            return Ok(entry);
        }
        let legacy = self.registry.is_legacy(&dir);
        let entry = load_entry(&dir_id, &dir, legacy)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("deployment {}", deployment_id)))?;
        let id = entry.snapshot().id;
        if id != deployment_id {
            debug!("Deployment {} resolved as {}", deployment_id, id);
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Ok(entries.entry(id).or_insert(entry).clone())
    }

    pub async fn get_record(&self, deployment_id: &str) -> Result<DeploymentRecord, AgentError> {
        Ok(self.entry_or_load(deployment_id).await?.snapshot())
    }

    pub fn list_records(&self) -> Vec<DeploymentRecord> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<DeploymentRecord> = entries.values().map(|e| e.snapshot()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Latest persisted snapshot; never waits on a worker
    pub async fn poll_status(&self, deployment_id: &str) -> Result<StatusView, AgentError> {
        let entry = self.entry_or_load(deployment_id).await?;
        let output_tail = entry.output.tail(self.options.tail_lines);
        Ok(self.view(&entry, output_tail))
    }

    /// Like `poll_status`, with only the output after `cursor`
    pub async fn poll_since(
        &self,
        deployment_id: &str,
        cursor: u64,
    ) -> Result<StatusView, AgentError> {
        let entry = self.entry_or_load(deployment_id).await?;
        let (lines, _) = entry.output.since(cursor);
        Ok(self.view(&entry, lines))
    }

    fn view(&self, entry: &DeploymentEntry, output_tail: Vec<String>) -> StatusView {
        let record = entry.snapshot();
        let terminal = record.status.is_terminal() && !entry.busy.load(Ordering::SeqCst);
        let elapsed = (Utc::now() - record.created_at).to_std().unwrap_or_default();
        let past_ceiling = elapsed >= self.options.poll_ceiling;

        let message = if !terminal && past_ceiling {
            Some(format!(
                "still running after {} minutes; check back later",
                elapsed.as_secs() / 60
            ))
        } else {
            record.message.clone()
        };

        StatusView {
            deployment_id: record.id.clone(),
            status: record.status,
            phase: record.phase,
            message,
            output_tail,
            cursor: entry.output.cursor(),
            resources_created: record
                .status
                .is_terminal()
                .then(|| record.resources.clone()),
            untracked_resources: record.untracked_resources.clone(),
            error_classification: record.error_classification,
            working_directory: record.working_directory.clone(),
            retry_of: record.retry_of.clone(),
            attempt: record.attempt,
            keep_polling: !terminal && !past_ceiling,
        }
    }

    pub fn is_busy(&self, deployment_id: &str) -> bool {
        self.entry(deployment_id)
            .map(|e| e.busy.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Cancel a deployment that has not crossed the apply boundary
    pub async fn cancel(&self, deployment_id: &str) -> Result<DeploymentRecord, AgentError> {
        let entry = self.entry_or_load(deployment_id).await?;
        let mut fsm = entry.fsm.lock().await;
        if !fsm.is_cancellable() {
            return Err(AgentError::InvalidTransition(format!(
                "deployment {} is {} and can no longer be cancelled",
                deployment_id,
                fsm.state().as_str()
            )));
        }
        let status = fsm.process(DeploymentEvent::Cancel)?;
        entry.cancel.send_replace(true);
        let record = entry
            .update(|r| {
                r.status = status;
                r.phase = ProgressPhase::Done;
                r.last_transition_at = Utc::now();
                r.message = Some("cancelled before apply".to_string());
            })
            .await?;
        info!("Cancelled deployment {}", deployment_id);
        Ok(record)
    }

    /// Exclusive hold on an idle deployment for an out-of-band operation
    pub async fn acquire(&self, deployment_id: &str) -> Result<OperationGuard, AgentError> {
        let entry = self.entry_or_load(deployment_id).await?;
        let fsm = entry.fsm.lock().await;
        if !fsm.state().is_terminal() {
            return Err(AgentError::DeploymentBusy(format!(
                "deployment {} is {}",
                deployment_id,
                fsm.state().as_str()
            )));
        }
        if entry.busy.swap(true, Ordering::SeqCst) {
            return Err(AgentError::DeploymentBusy(format!(
                "deployment {} has an operation in progress",
                deployment_id
            )));
        }
        drop(fsm);
        Ok(OperationGuard { entry })
    }

    /// Destroy a deployment's resources in the background. The record and its
    /// directory are removed once the tool reports nothing left.
    pub async fn destroy(self: &Arc<Self>, deployment_id: &str) -> Result<(), AgentError> {
        let guard = self.acquire(deployment_id).await?;
        let tracker = self.clone();
        let id = deployment_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = tracker.run_destroy(&guard).await {
                error!("Destroy of {} failed: {}", id, e);
                let message = format!("destroy failed: {}", e);
                if let Err(e) = guard.update(|r| r.message = Some(message)).await {
                    warn!("Failed to persist destroy failure of {}: {}", id, e);
                }
            }
        });
        self.track_worker(handle);
        Ok(())
    }

    async fn run_destroy(&self, guard: &OperationGuard) -> Result<(), AgentError> {
        let entry = &guard.entry;
        let record = entry
            .update(|r| {
                r.phase = ProgressPhase::Destroy;
                r.message = Some("destroying".to_string());
                r.last_transition_at = Utc::now();
            })
            .await?;
        let dir = record.working_directory.as_path();
        let tool = self.engine.tool();

        entry.output.push("==> destroy").await;
        let init = tool.init(dir, &entry.output, None).await?;
        if !classify_phase(&init).is_success() {
            warn!("Re-init before destroy of {} failed", record.id);
        }
        let out = tool.destroy(dir, &entry.output).await?;
        let verdict = classify_phase(&out);
        let remaining = tool.state_list(dir).await?;

        if remaining.is_empty() {
            info!("Destroyed deployment {}; removing {}", record.id, dir.display());
            {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                entries.remove(&record.id);
            }
            if let Some(discovery) = &self.discovery {
                discovery.forget_deployment(&record.id);
            }
            Dir::new(dir).delete().await?;
            return Ok(());
        }

        warn!(
            "Destroy of {} left {} resources ({:?})",
            record.id,
            remaining.len(),
            verdict
        );
        let message = format!("destroy incomplete: {} resources remain", remaining.len());
        entry
            .update(|r| {
                r.phase = ProgressPhase::Done;
                r.message = Some(message);
                r.resources = remaining;
                r.last_transition_at = Utc::now();
            })
            .await?;
        Ok(())
    }

    /// Unredacted parameters of a deployment, from its variables file
    pub async fn parameters_of(&self, deployment_id: &str) -> Result<ParameterSet, AgentError> {
        let record = self.get_record(deployment_id).await?;
        let dir = Dir::new(&record.working_directory);
        let template = self.template_of(&record).await?;
        let raw: serde_json::Value = dir.file(VARIABLES_FILE).read_json().await?;
        Ok(ParameterSet::from_tfvars_json(&raw, &template.parameters))
    }

    /// Template as written to the deployment's directory
    pub async fn template_of(&self, record: &DeploymentRecord) -> Result<Template, AgentError> {
        let content = Dir::new(&record.working_directory)
            .file(TEMPLATE_FILE)
            .read_string_opt()
            .await?;
        match content {
            Some(content) => parse_template(&record.template_id, &content),
            None => self.catalog.get(&record.template_id).await,
        }
    }

    /// Reload every deployment the registry knows. Interrupted init/plan runs
    /// are resumed; interrupted applies become partially failed.
    pub async fn load_existing(self: &Arc<Self>) -> Result<usize, AgentError> {
        let mut loaded = 0;
        for dir in self.registry.list().await? {
            if self.entry(&dir.deployment_id).is_some() {
                continue;
            }
            let entry = match load_entry(&dir.deployment_id, &dir.path, dir.legacy).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping {}: {}", dir.path.display(), e);
                    continue;
                }
            };
            {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                entries.insert(dir.deployment_id.clone(), entry.clone());
            }
            loaded += 1;

            let record = entry.snapshot();
            match record.status {
                DeploymentStatus::Pending | DeploymentStatus::Planning if !record.legacy => {
                    if let Err(e) = self.resume(&entry, &record).await {
                        warn!("Cannot resume {}: {}", record.id, e);
                        let message = format!("interrupted and not resumable: {}", e);
                        let mut fsm = entry.fsm.lock().await;
                        let status = fsm.process(DeploymentEvent::Failed(message.clone()))?;
                        entry
                            .update(|r| {
                                r.status = status;
                                r.phase = ProgressPhase::Done;
                                r.message = Some(message);
                                r.error_classification = Some(FailureKind::Unknown);
                            })
                            .await?;
                    }
                }
                DeploymentStatus::Applying => self.settle_interrupted_apply(&entry, &record).await?,
                _ => {}
            }
        }
        info!("Loaded {} existing deployments", loaded);
        Ok(loaded)
    }

    async fn resume(
        self: &Arc<Self>,
        entry: &Arc<DeploymentEntry>,
        record: &DeploymentRecord,
    ) -> Result<(), AgentError> {
        let template = self.template_of(record).await?;
        let raw: serde_json::Value = Dir::new(&record.working_directory)
            .file(VARIABLES_FILE)
            .read_json()
            .await?;
        let parameters = ParameterSet::from_tfvars_json(&raw, &template.parameters);
        info!("Resuming deployment {} after restart", record.id);
        entry.output.push("==> resumed after restart").await;

        let request = ExecutionRequest {
            deployment_id: record.id.clone(),
            working_directory: record.working_directory.clone(),
            template,
            parameters,
            imports: Vec::new(),
        };
        self.spawn_execution(entry.clone(), request, Duration::ZERO);
        Ok(())
    }

    async fn settle_interrupted_apply(
        &self,
        entry: &Arc<DeploymentEntry>,
        record: &DeploymentRecord,
    ) -> Result<(), AgentError> {
        let template = self.template_of(record).await?;
        let listed = self
            .engine
            .tool()
            .state_list(&record.working_directory)
            .await?;
        let (resources, untracked) = partition_resources(&template, &record.imported, listed);
        warn!(
            "Deployment {} was interrupted during apply; {} resources are live",
            record.id,
            resources.len()
        );

        let mut message = "interrupted during apply".to_string();
        if record.working_directory.join(LOCK_FILE).exists() {
            warn!(
                "Deployment {} left a state lock behind in {}",
                record.id,
                record.working_directory.display()
            );
            message.push_str("; state lock left behind, review before unlocking");
        }
        let mut fsm = entry.fsm.lock().await;
        let status = fsm.process(DeploymentEvent::PartiallyFailed(message.clone()))?;
        entry
            .update(|r| {
                r.status = status;
                r.phase = ProgressPhase::Done;
                r.last_transition_at = Utc::now();
                r.message = Some(message);
                r.resources = resources;
                r.untracked_resources = untracked;
                r.error_classification = Some(FailureKind::PartialApply);
            })
            .await?;
        Ok(())
    }

    /// Wait for running workers. Applies are never killed.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), AgentError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        info!("Waiting for {} deployment workers", handles.len());

        let wait = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Deployment worker panicked: {}", e);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            AgentError::ShutdownError("deployment workers still running".to_string())
        })
    }
}

/// Marks a deployment busy until dropped
pub struct OperationGuard {
    entry: Arc<DeploymentEntry>,
}

impl OperationGuard {
    pub fn record(&self) -> DeploymentRecord {
        self.entry.snapshot()
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.entry.output
    }

    pub async fn update(
        &self,
        update: impl FnOnce(&mut DeploymentRecord),
    ) -> Result<DeploymentRecord, AgentError> {
        self.entry.update(update).await
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.entry.busy.store(false, Ordering::SeqCst);
    }
}

/// Fill defaults and reject missing or undeclared parameters
pub fn resolve_parameters(
    template: &Template,
    provided: &ParameterSet,
) -> Result<ParameterSet, AgentError> {
    let undeclared: Vec<&str> = provided
        .iter()
        .map(|(name, _)| name)
        .filter(|name| template.definition(name).is_none())
        .collect();
    if !undeclared.is_empty() {
        return Err(AgentError::ConfigError(format!(
            "template {} does not declare: {}",
            template.id,
            undeclared.join(", ")
        )));
    }

    let mut definitions: Vec<_> = template.parameters.iter().collect();
    definitions.sort_by_key(|d| d.order);

    let mut resolved = ParameterSet::new();
    let mut missing = Vec::new();
    for definition in definitions {
        match (provided.get(&definition.name), &definition.default_value) {
            (Some(value), _) => resolved.insert(definition.name.clone(), value.clone()),
            (None, Some(default)) => resolved.insert(definition.name.clone(), default.clone()),
            (None, None) if definition.required => missing.push(definition.name.clone()),
            (None, None) => {}
        }
    }
    if !missing.is_empty() {
        return Err(AgentError::ConfigError(format!(
            "missing required parameters for {}: {}",
            template.id,
            missing.join(", ")
        )));
    }
    Ok(resolved)
}

/// Entry for a directory: its record, or a synthesized read-only one when
/// the directory predates records. `None` when it holds no deployment.
async fn load_entry(
    deployment_id: &str,
    dir: &std::path::Path,
    legacy: bool,
) -> Result<Option<Arc<DeploymentEntry>>, AgentError> {
    let record_file = File::new(dir.join(RECORD_FILE));
    let record = match record_file.read_json_opt::<DeploymentRecord>().await? {
        Some(mut record) => {
            record.working_directory = dir.to_path_buf();
            record
        }
        None => {
            let state = StateSnapshot::load(dir).await?;
            let has_template = File::new(dir.join(TEMPLATE_FILE)).exists().await;
            if state.is_none() && !has_template {
                return Ok(None);
            }
            let resources = state.map(|s| s.addresses()).unwrap_or_default();
            let mut record =
                DeploymentRecord::legacy(deployment_id.to_string(), dir.to_path_buf(), resources);
            record.legacy = record.legacy || legacy;
            record
        }
    };

    let output = if record.legacy {
        OutputBuffer::in_memory()
    } else {
        OutputBuffer::open(File::new(dir.join(OUTPUT_LOG))).await?
    };
    Ok(Some(DeploymentEntry::new(record, output)))
}

/// Mirrors engine phases into the record and enforces the apply boundary
struct TrackerListener {
    entry: Arc<DeploymentEntry>,
}

#[async_trait]
impl PhaseListener for TrackerListener {
    async fn entering(&self, phase: Phase) -> Result<bool, AgentError> {
        let mut fsm = self.entry.fsm.lock().await;
        if fsm.state().is_terminal() {
            return Ok(false);
        }

        let progress = match phase {
            Phase::Init => ProgressPhase::Init,
            Phase::Import => ProgressPhase::Import,
            Phase::Plan => ProgressPhase::Plan,
            Phase::Apply => ProgressPhase::Apply,
            Phase::Destroy => ProgressPhase::Destroy,
            Phase::StateList | Phase::Output => return Ok(true),
        };

        let status = if phase == Phase::Apply {
            fsm.process(DeploymentEvent::StartApply)?
        } else {
            fsm.state()
        };
        self.entry
            .update(|r| {
                r.status = status;
                r.phase = progress;
                r.last_transition_at = Utc::now();
            })
            .await?;
        Ok(true)
    }
}
