//! Deployment id to working directory mapping

pub mod tiers;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::registry::tiers::{ExactMatch, LookupTier, LooseScan};

/// Template source written by the engine
pub const TEMPLATE_FILE: &str = "main.tf";
/// Variables file read by the tool
pub const VARIABLES_FILE: &str = "terraform.tfvars.json";
/// State file owned by the tool
pub const STATE_FILE: &str = "terraform.tfstate";
/// Lock file the tool holds while it runs
pub const LOCK_FILE: &str = ".terraform.tfstate.lock.info";
/// Persisted deployment record
pub const RECORD_FILE: &str = "deployment.json";
/// Append-only output of every tool invocation
pub const OUTPUT_LOG: &str = "output.log";
/// Cluster credentials extracted from apply outputs
pub const CREDENTIALS_FILE: &str = "cluster-credentials.json";

/// A directory known to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredDir {
    pub deployment_id: String,
    pub path: PathBuf,
    /// Lives under a legacy root
    pub legacy: bool,
}

/// Assigns and finds per-deployment working directories.
///
/// New directories are only ever created under the persistent root. Legacy
/// roots are read-only and consulted by `find` and `list`.
pub struct DirectoryRegistry {
    persistent_root: Dir,
    legacy_roots: Vec<Dir>,
    tiers: Vec<Box<dyn LookupTier>>,
}

impl DirectoryRegistry {
    /// Registry with the default tiers: persistent exact match, each legacy
    /// root exact match, then a loose scan of all roots
    pub fn new(persistent_root: Dir, legacy_roots: Vec<Dir>) -> Self {
        let mut tiers: Vec<Box<dyn LookupTier>> = Vec::new();
        tiers.push(Box::new(ExactMatch::new("persistent", persistent_root.clone())));
        for (i, root) in legacy_roots.iter().enumerate() {
            tiers.push(Box::new(ExactMatch::new(format!("legacy-{}", i), root.clone())));
        }
        let mut all_roots = vec![persistent_root.clone()];
        all_roots.extend(legacy_roots.iter().cloned());
        tiers.push(Box::new(LooseScan::new(all_roots)));

        Self {
            persistent_root,
            legacy_roots,
            tiers,
        }
    }

    /// Append a lookup tier after the existing ones
    pub fn with_tier(mut self, tier: Box<dyn LookupTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Create `<persistentRoot>/<deploymentId>/` if absent and return it.
    ///
    /// Repeated calls return the same path and never touch its contents.
    pub async fn assign(&self, deployment_id: &str) -> Result<PathBuf, AgentError> {
        validate_deployment_id(deployment_id)?;
        let dir = self.persistent_root.subdir(deployment_id);
        if !dir.exists().await {
            dir.create().await?;
            info!("Assigned {} to {}", deployment_id, dir.path().display());
        }
        Ok(dir.path().to_path_buf())
    }

    /// Locate a deployment's directory, trying each tier in order
    pub async fn find(&self, deployment_id: &str) -> Result<Option<PathBuf>, AgentError> {
        if validate_deployment_id(deployment_id).is_err() {
            return Ok(None);
        }
        for tier in &self.tiers {
            if let Some(path) = tier.lookup(deployment_id).await? {
                debug!(
                    "Found {} via tier '{}': {}",
                    deployment_id,
                    tier.name(),
                    path.display()
                );
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Every directory under every root, persistent entries first. A legacy
    /// directory sharing an id with a persistent one is skipped.
    pub async fn list(&self) -> Result<Vec<RegisteredDir>, AgentError> {
        let mut seen = HashSet::new();
        let mut dirs = Vec::new();

        let roots = std::iter::once((&self.persistent_root, false))
            .chain(self.legacy_roots.iter().map(|r| (r, true)));
        for (root, legacy) in roots {
            for path in root.list_dirs().await? {
                let Some(id) = path.file_name().and_then(|n| n.to_str()).map(String::from)
                else {
                    continue;
                };
                if seen.insert(id.clone()) {
                    dirs.push(RegisteredDir {
                        deployment_id: id,
                        path,
                        legacy,
                    });
                }
            }
        }
        Ok(dirs)
    }

    /// Whether a path lives under one of the legacy roots
    pub fn is_legacy(&self, path: &Path) -> bool {
        self.legacy_roots.iter().any(|root| path.starts_with(root.path()))
    }
}

/// Ids become directory names; only path-safe characters are accepted
pub fn validate_deployment_id(deployment_id: &str) -> Result<(), AgentError> {
    let valid = !deployment_id.is_empty()
        && deployment_id.len() <= 128
        && deployment_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && deployment_id != "."
        && deployment_id != "..";
    if !valid {
        return Err(AgentError::ValidationError(format!(
            "invalid deployment id '{}'",
            deployment_id
        )));
    }
    Ok(())
}
