//! The external provisioning tool, driven as a subprocess

use std::collections::BTreeMap;
use std::future::pending;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::deploy::output::OutputBuffer;
use crate::errors::AgentError;

/// Fires `true` to kill a running init or plan
pub type CancelSignal = watch::Receiver<bool>;

/// Tool invocation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Import,
    Plan,
    Apply,
    Destroy,
    StateList,
    Output,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Import => "import",
            Phase::Plan => "plan",
            Phase::Apply => "apply",
            Phase::Destroy => "destroy",
            Phase::StateList => "state list",
            Phase::Output => "output",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Captured result of one invocation
#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub phase: Phase,
    pub exit_code: Option<i32>,
    /// Both streams, in arrival order
    pub lines: Vec<OutputLine>,
    /// Killed by a cancel signal
    pub cancelled: bool,
}

impl PhaseOutput {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            exit_code: None,
            lines: Vec::new(),
            cancelled: false,
        }
    }

    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0) && !self.cancelled
    }

    pub fn text_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|l| l.text.as_str())
    }

    pub fn stdout(&self) -> String {
        self.lines
            .iter()
            .filter(|l| l.stream == Stream::Stdout)
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|a| a.to_string()).collect()
}

fn tool_failure(dir: &Path, phase: Phase, output: &PhaseOutput) -> AgentError {
    let detail = output
        .lines
        .iter()
        .filter(|l| l.stream == Stream::Stderr)
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    AgentError::ExecutionError {
        deployment_id: dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string(),
        message: format!(
            "{} exited with {:?}: {}",
            phase.as_str(),
            output.exit_code,
            detail
        ),
        retryable: false,
    }
}

/// The provisioning tool's CLI contract.
///
/// Implementors provide `run`; the phase helpers build the argument lists.
#[async_trait]
pub trait ProvisioningTool: Send + Sync {
    /// Run the tool in `dir`, streaming every line into `output` when given
    async fn run(
        &self,
        dir: &Path,
        phase: Phase,
        args: &[String],
        output: Option<&OutputBuffer>,
        cancel: Option<CancelSignal>,
    ) -> Result<PhaseOutput, AgentError>;

    async fn init(
        &self,
        dir: &Path,
        output: &OutputBuffer,
        cancel: Option<CancelSignal>,
    ) -> Result<PhaseOutput, AgentError> {
        let args = args(&["init", "-input=false", "-no-color"]);
        self.run(dir, Phase::Init, &args, Some(output), cancel).await
    }

    async fn plan(
        &self,
        dir: &Path,
        output: &OutputBuffer,
        cancel: Option<CancelSignal>,
    ) -> Result<PhaseOutput, AgentError> {
        let args = args(&["plan", "-input=false", "-no-color"]);
        self.run(dir, Phase::Plan, &args, Some(output), cancel).await
    }

    /// Never given a cancel signal: an apply is not interrupted
    async fn apply(&self, dir: &Path, output: &OutputBuffer) -> Result<PhaseOutput, AgentError> {
        let args = args(&["apply", "-auto-approve", "-input=false", "-no-color"]);
        self.run(dir, Phase::Apply, &args, Some(output), None).await
    }

    async fn import(
        &self,
        dir: &Path,
        address: &str,
        external_id: &str,
        output: &OutputBuffer,
    ) -> Result<PhaseOutput, AgentError> {
        let args = vec![
            "import".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            address.to_string(),
            external_id.to_string(),
        ];
        self.run(dir, Phase::Import, &args, Some(output), None).await
    }

    async fn destroy(&self, dir: &Path, output: &OutputBuffer) -> Result<PhaseOutput, AgentError> {
        let args = args(&["destroy", "-auto-approve", "-input=false", "-no-color"]);
        self.run(dir, Phase::Destroy, &args, Some(output), None).await
    }

    /// Authoritative list of managed addresses
    async fn state_list(&self, dir: &Path) -> Result<Vec<String>, AgentError> {
        let out = self
            .run(dir, Phase::StateList, &args(&["state", "list"]), None, None)
            .await?;
        if !out.exited_cleanly() {
            if out.text_lines().any(|l| l.contains("No state file")) {
                return Ok(Vec::new());
            }
            return Err(tool_failure(dir, Phase::StateList, &out));
        }
        Ok(out
            .lines
            .iter()
            .filter(|l| l.stream == Stream::Stdout)
            .map(|l| l.text.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Root module outputs, sensitive values included
    async fn outputs(&self, dir: &Path) -> Result<Value, AgentError> {
        let out = self
            .run(dir, Phase::Output, &args(&["output", "-json"]), None, None)
            .await?;
        if !out.exited_cleanly() {
            return Err(tool_failure(dir, Phase::Output, &out));
        }
        let stdout = out.stdout();
        if stdout.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&stdout)?)
    }
}

/// Terraform (or a CLI-compatible fork) on the PATH
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: String,
    env: BTreeMap<String, String>,
}

impl TerraformCli {
    pub fn new(binary: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            binary: binary.into(),
            env,
        }
    }
}

async fn cancelled(cancel: &mut Option<CancelSignal>) {
    let Some(rx) = cancel.as_mut() else {
        return pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return pending().await;
        }
    }
}

#[async_trait]
impl ProvisioningTool for TerraformCli {
    async fn run(
        &self,
        dir: &Path,
        phase: Phase,
        args: &[String],
        output: Option<&OutputBuffer>,
        mut cancel: Option<CancelSignal>,
    ) -> Result<PhaseOutput, AgentError> {
        debug!("{} {} in {}", self.binary, args.join(" "), dir.display());

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(dir)
            .envs(&self.env)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::ConfigError(format!("failed to spawn '{}': {}", self.binary, e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Internal("child stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Internal("child stderr not piped".to_string()))?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();

        let mut result = PhaseOutput::new(phase);
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut cancel_armed = cancel.is_some();

        while stdout_open || stderr_open {
            let (stream, line) = tokio::select! {
                line = stdout.next_line(), if stdout_open => (Stream::Stdout, line?),
                line = stderr.next_line(), if stderr_open => (Stream::Stderr, line?),
                _ = cancelled(&mut cancel), if cancel_armed => {
                    warn!("Cancelling {} in {}", phase.as_str(), dir.display());
                    cancel_armed = false;
                    result.cancelled = true;
                    child.start_kill()?;
                    continue;
                }
            };
            match line {
                Some(text) => {
                    if let Some(output) = output {
                        output.push(text.clone()).await;
                    }
                    result.lines.push(OutputLine { stream, text });
                }
                None if stream == Stream::Stdout => stdout_open = false,
                None => stderr_open = false,
            }
        }

        let status = child.wait().await?;
        result.exit_code = status.code();
        Ok(result)
    }
}
