//! Shared fixtures: a scripted provisioning tool and a wired tracker
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use infragent::cluster::cache::ConnectionCache;
use infragent::cluster::connector::ClusterConnector;
use infragent::cluster::discovery::ClusterDiscoveryService;
use infragent::deploy::executor::ExecutionEngine;
use infragent::deploy::output::OutputBuffer;
use infragent::deploy::tool::{CancelSignal, OutputLine, Phase, PhaseOutput, ProvisioningTool, Stream};
use infragent::deploy::tracker::{DeploymentTracker, StatusView, TrackerOptions};
use infragent::errors::AgentError;
use infragent::filesys::dir::Dir;
use infragent::models::cluster::{ClusterIdentity, CredentialBundle};
use infragent::registry::{DirectoryRegistry, STATE_FILE, TEMPLATE_FILE, VARIABLES_FILE};
use infragent::templates::{parse_template, MemoryTemplateCatalog};

/// How one apply behaves
#[derive(Debug, Clone)]
pub enum ApplyScript {
    /// Every declared resource is created
    Succeed,
    /// Nothing is created
    Fail(Vec<String>),
    /// The first `created` declared resources are created, then the apply fails
    Partial { created: usize, error: String },
}

#[derive(Default)]
struct Script {
    applies: VecDeque<ApplyScript>,
    plan_delay: Duration,
    apply_delay: Duration,
    calls: Vec<(String, Phase)>,
}

/// Stands in for the tool binary. State lives in a real `terraform.tfstate`
/// so discovery and recovery read what the tool would have written.
#[derive(Default)]
pub struct FakeTool {
    script: Mutex<Script>,
}

impl FakeTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue apply behaviours; once drained every apply succeeds
    pub fn script_applies(&self, applies: impl IntoIterator<Item = ApplyScript>) {
        let mut script = self.script.lock().unwrap();
        script.applies.extend(applies);
    }

    pub fn set_plan_delay(&self, delay: Duration) {
        self.script.lock().unwrap().plan_delay = delay;
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        self.script.lock().unwrap().apply_delay = delay;
    }

    /// Phases invoked for one deployment directory, in order
    pub fn calls_for(&self, deployment_id: &str) -> Vec<Phase> {
        let script = self.script.lock().unwrap();
        script
            .calls
            .iter()
            .filter(|(id, _)| id == deployment_id)
            .map(|(_, phase)| *phase)
            .collect()
    }

    fn next_apply(&self) -> ApplyScript {
        let mut script = self.script.lock().unwrap();
        script.applies.pop_front().unwrap_or(ApplyScript::Succeed)
    }

    fn record_call(&self, dir: &Path, phase: Phase) {
        let id = dir_id(dir);
        self.script.lock().unwrap().calls.push((id, phase));
    }

    fn delay(&self, phase: Phase) -> Duration {
        let script = self.script.lock().unwrap();
        match phase {
            Phase::Plan => script.plan_delay,
            Phase::Apply => script.apply_delay,
            _ => Duration::ZERO,
        }
    }
}

fn dir_id(dir: &Path) -> String {
    dir.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

fn variables(dir: &Path) -> Value {
    std::fs::read_to_string(dir.join(VARIABLES_FILE))
        .ok()
        .and_then(|c| serde_json::from_str(&c).ok())
        .unwrap_or_else(|| json!({}))
}

fn declared_resources(dir: &Path) -> Vec<String> {
    let content = std::fs::read_to_string(dir.join(TEMPLATE_FILE)).unwrap_or_default();
    parse_template("fake", &content)
        .map(|t| {
            t.resources
                .into_iter()
                .filter(|r| !r.starts_with("module."))
                .collect()
        })
        .unwrap_or_default()
}

fn read_state(dir: &Path) -> Value {
    std::fs::read_to_string(dir.join(STATE_FILE))
        .ok()
        .and_then(|c| serde_json::from_str(&c).ok())
        .unwrap_or_else(|| json!({ "version": 4, "resources": [] }))
}

fn write_state(dir: &Path, state: &Value) {
    std::fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state).unwrap()).unwrap();
}

fn state_resource(address: &str, vars: &Value) -> Value {
    let (resource_type, name) = address.split_once('.').unwrap_or((address, "main"));
    let attr_name = match resource_type {
        t if t.contains("kubernetes_cluster") || t.contains("container_cluster") => vars
            .get("cluster_name")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string(),
        _ => name.to_string(),
    };
    json!({
        "mode": "managed",
        "type": resource_type,
        "name": name,
        "instances": [{ "attributes": { "name": attr_name, "id": format!("/fake/{}", address) } }]
    })
}

fn add_to_state(dir: &Path, addresses: &[String]) {
    let vars = variables(dir);
    let mut state = read_state(dir);
    let resources = state["resources"].as_array_mut().unwrap();
    for address in addresses {
        let exists = resources.iter().any(|r| {
            format!("{}.{}", r["type"].as_str().unwrap_or(""), r["name"].as_str().unwrap_or(""))
                == *address
        });
        if !exists {
            resources.push(state_resource(address, &vars));
        }
    }
    write_state(dir, &state);
}

fn state_addresses(dir: &Path) -> Vec<String> {
    let state = read_state(dir);
    state["resources"]
        .as_array()
        .map(|resources| {
            resources
                .iter()
                .map(|r| {
                    format!(
                        "{}.{}",
                        r["type"].as_str().unwrap_or_default(),
                        r["name"].as_str().unwrap_or_default()
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn outputs(dir: &Path) -> Value {
    let vars = variables(dir);
    match vars.get("cluster_name").and_then(Value::as_str) {
        Some(name) => json!({
            "cluster_credentials": {
                "sensitive": true,
                "value": {
                    "host": format!("https://{}.example.test", name),
                    "token": "fake-token",
                }
            }
        }),
        None => json!({}),
    }
}

async fn emit(out: &mut PhaseOutput, output: Option<&OutputBuffer>, stream: Stream, text: String) {
    if let Some(buffer) = output {
        buffer.push(text.clone()).await;
    }
    out.lines.push(OutputLine { stream, text });
}

async fn wait_or_cancel(delay: Duration, cancel: Option<CancelSignal>) -> bool {
    if delay.is_zero() {
        return false;
    }
    match cancel {
        Some(mut rx) => {
            tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = rx.wait_for(|c| *c) => true,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            false
        }
    }
}

#[async_trait]
impl ProvisioningTool for FakeTool {
    async fn run(
        &self,
        dir: &Path,
        phase: Phase,
        args: &[String],
        output: Option<&OutputBuffer>,
        cancel: Option<CancelSignal>,
    ) -> Result<PhaseOutput, AgentError> {
        self.record_call(dir, phase);
        let id = dir_id(dir);
        let mut out = PhaseOutput::new(phase);

        if wait_or_cancel(self.delay(phase), cancel).await {
            out.cancelled = true;
            return Ok(out);
        }

        match phase {
            Phase::Init => {
                std::fs::create_dir_all(dir.join(".terraform"))?;
                emit(&mut out, output, Stream::Stdout, format!("Initializing {}", id)).await;
                emit(
                    &mut out,
                    output,
                    Stream::Stdout,
                    "Terraform has been successfully initialized!".to_string(),
                )
                .await;
                out.exit_code = Some(0);
            }
            Phase::Plan => {
                let declared = declared_resources(dir);
                emit(&mut out, output, Stream::Stdout, format!("Planning {}", id)).await;
                emit(
                    &mut out,
                    output,
                    Stream::Stdout,
                    format!("Plan: {} to add, 0 to change, 0 to destroy.", declared.len()),
                )
                .await;
                out.exit_code = Some(0);
            }
            Phase::Apply => match self.next_apply() {
                ApplyScript::Succeed => {
                    let declared = declared_resources(dir);
                    add_to_state(dir, &declared);
                    emit(&mut out, output, Stream::Stdout, format!("Applying {}", id)).await;
                    emit(
                        &mut out,
                        output,
                        Stream::Stdout,
                        format!(
                            "Apply complete! Resources: {} added, 0 changed, 0 destroyed.",
                            declared.len()
                        ),
                    )
                    .await;
                    out.exit_code = Some(0);
                }
                ApplyScript::Fail(errors) => {
                    for error in errors {
                        emit(&mut out, output, Stream::Stderr, error).await;
                    }
                    out.exit_code = Some(1);
                }
                ApplyScript::Partial { created, error } => {
                    let declared: Vec<String> =
                        declared_resources(dir).into_iter().take(created).collect();
                    add_to_state(dir, &declared);
                    emit(&mut out, output, Stream::Stderr, error).await;
                    out.exit_code = Some(1);
                }
            },
            Phase::Import => {
                let address = args.get(args.len().saturating_sub(2)).cloned().unwrap_or_default();
                add_to_state(dir, &[address.clone()]);
                emit(&mut out, output, Stream::Stdout, format!("{}: Importing...", address)).await;
                emit(&mut out, output, Stream::Stdout, "Import successful!".to_string()).await;
                out.exit_code = Some(0);
            }
            Phase::Destroy => {
                let count = state_addresses(dir).len();
                write_state(dir, &json!({ "version": 4, "resources": [] }));
                emit(
                    &mut out,
                    output,
                    Stream::Stdout,
                    format!("Destroy complete! Resources: {} destroyed.", count),
                )
                .await;
                out.exit_code = Some(0);
            }
            Phase::StateList => {
                for address in state_addresses(dir) {
                    emit(&mut out, output, Stream::Stdout, address).await;
                }
                out.exit_code = Some(0);
            }
            Phase::Output => {
                let json = serde_json::to_string(&outputs(dir))?;
                emit(&mut out, output, Stream::Stdout, json).await;
                out.exit_code = Some(0);
            }
        }
        Ok(out)
    }
}

/// Connector whose health checks always pass and are counted
#[derive(Default)]
pub struct CountingConnector {
    pub checks: Mutex<Vec<ClusterIdentity>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl CountingConnector {
    pub fn count(&self) -> usize {
        self.checks.lock().unwrap().len()
    }
}

#[async_trait]
impl ClusterConnector for CountingConnector {
    async fn health_check(
        &self,
        identity: &ClusterIdentity,
        _credentials: &CredentialBundle,
    ) -> Result<(), AgentError> {
        self.checks.lock().unwrap().push(identity.clone());
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AgentError::ClusterError(format!("{} unreachable", identity)));
        }
        Ok(())
    }
}

pub const NETWORK_TEMPLATE: &str = r#"
variable "name" {
  type    = string
  default = "demo"
}

variable "location" {
  type    = string
  default = "eastus"
}

variable "address_space" {
  type    = string
  default = "10.0.0.0/16"
}

resource "azurerm_resource_group" "main" {
  name     = var.name
  location = var.location
}

resource "azurerm_virtual_network" "main" {
  name          = "${var.name}-vnet"
  address_space = [var.address_space]
}
"#;

pub const CLUSTER_TEMPLATE: &str = r#"
variable "cluster_name" {
  type = string
}

variable "location" {
  type    = string
  default = "eastus"
}

variable "node_vm_size" {
  type    = string
  default = "Standard_D2s_v3"
}

resource "azurerm_resource_group" "main" {
  name     = "rg-${var.cluster_name}"
  location = var.location
}

resource "azurerm_kubernetes_cluster" "main" {
  name     = var.cluster_name
  location = var.location
}

output "cluster_credentials" {
  value     = azurerm_kubernetes_cluster.main.kube_config[0]
  sensitive = true
}
"#;

/// Everything a tracker test needs, rooted in a temp directory
pub struct Harness {
    pub root: tempfile::TempDir,
    pub tool: Arc<FakeTool>,
    pub connector: Arc<CountingConnector>,
    pub catalog: Arc<MemoryTemplateCatalog>,
    pub registry: Arc<DirectoryRegistry>,
    pub discovery: Arc<ClusterDiscoveryService>,
    pub tracker: Arc<DeploymentTracker>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(TrackerOptions::default())
    }

    pub fn with_options(options: TrackerOptions) -> Self {
        let root = tempfile::tempdir().unwrap();
        let tool = FakeTool::new();
        let connector = Arc::new(CountingConnector::default());

        let catalog = Arc::new(MemoryTemplateCatalog::new());
        catalog.insert_source("network", NETWORK_TEMPLATE).unwrap();
        catalog.insert_source("aks", CLUSTER_TEMPLATE).unwrap();

        let registry = Arc::new(DirectoryRegistry::new(
            Dir::new(root.path().join("deployments")),
            Vec::new(),
        ));
        let discovery = Arc::new(ClusterDiscoveryService::new(
            registry.clone(),
            connector.clone(),
            ConnectionCache::new(8, Duration::from_secs(300)),
        ));
        let tracker = Arc::new(DeploymentTracker::new(
            options,
            registry.clone(),
            catalog.clone(),
            Arc::new(ExecutionEngine::new(tool.clone())),
            Some(discovery.clone()),
        ));

        Self {
            root,
            tool,
            connector,
            catalog,
            registry,
            discovery,
            tracker,
        }
    }
}

/// Poll until the deployment is terminal and idle
pub async fn wait_terminal(tracker: &DeploymentTracker, deployment_id: &str) -> StatusView {
    for _ in 0..500 {
        let view = tracker.poll_status(deployment_id).await.unwrap();
        if view.status.is_terminal() && !tracker.is_busy(deployment_id) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("deployment {} did not finish", deployment_id);
}
