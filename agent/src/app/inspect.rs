//! Offline inspection behind the `--status` and `--resolve` flags

use std::fmt::Write;

use anyhow::{anyhow, Context};
use colored::Colorize;

use crate::cluster::discovery::ClusterDiscoveryService;
use crate::filesys::file::File;
use crate::models::deployment::{DeploymentRecord, DeploymentStatus};
use crate::registry::{DirectoryRegistry, RECORD_FILE};

/// Human-readable status of one deployment, read straight from disk
pub async fn status_report(
    registry: &DirectoryRegistry,
    deployment_id: &str,
) -> anyhow::Result<String> {
    let dir = registry
        .find(deployment_id)
        .await
        .context("scanning deployment roots")?
        .ok_or_else(|| anyhow!("no deployment directory matches {}", deployment_id))?;

    let record = File::new(dir.join(RECORD_FILE))
        .read_json_opt::<DeploymentRecord>()
        .await
        .with_context(|| format!("reading the record in {}", dir.display()))?;
    let Some(record) = record else {
        return Ok(format!(
            "{} {} (legacy directory, no record)\n",
            deployment_id.bold(),
            dir.display()
        ));
    };

    let status = match record.status {
        DeploymentStatus::Completed => record.status.as_str().green(),
        DeploymentStatus::Failed | DeploymentStatus::PartiallyFailed => {
            record.status.as_str().red()
        }
        _ => record.status.as_str().yellow(),
    };
    let mut out = String::new();
    writeln!(out, "{} {}", record.id.bold(), status)?;
    writeln!(out, "  template:  {}", record.template_id)?;
    writeln!(out, "  phase:     {}", record.phase.as_str())?;
    writeln!(out, "  directory: {}", record.working_directory.display())?;
    if let Some(previous) = &record.retry_of {
        writeln!(out, "  retry of:  {} (attempt {})", previous, record.attempt)?;
    }
    if let Some(message) = &record.message {
        writeln!(out, "  message:   {}", message)?;
    }
    for error in &record.errors {
        writeln!(out, "  {} {}", "!".red(), error)?;
    }
    if !record.resources.is_empty() {
        writeln!(out, "  resources:")?;
        for address in &record.resources {
            writeln!(out, "    {}", address)?;
        }
    }
    for address in &record.untracked_resources {
        writeln!(out, "    {} {}", address, "(untracked)".yellow())?;
    }
    Ok(out)
}

/// Which cluster a hint picks, without connecting to it
pub async fn cluster_report(
    discovery: &ClusterDiscoveryService,
    hint: Option<&str>,
) -> anyhow::Result<String> {
    let candidate = discovery.locate(hint).await.with_context(|| match hint {
        Some(hint) => format!("locating cluster '{}'", hint),
        None => "locating the only cluster".to_string(),
    })?;
    let mut out = String::new();
    writeln!(
        out,
        "{} {}",
        candidate.identity.name.bold(),
        candidate.summary.resource_type
    )?;
    writeln!(out, "  deployment: {}", candidate.identity.deployment_id)?;
    writeln!(out, "  directory:  {}", candidate.working_directory.display())?;
    Ok(out)
}
