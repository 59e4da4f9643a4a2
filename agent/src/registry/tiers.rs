//! Lookup tiers consulted by `DirectoryRegistry::find`, in order

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::registry::STATE_FILE;
use crate::utils::normalize_loose;

/// State files larger than this are not content-scanned
pub const MAX_SCAN_BYTES: u64 = 16 * 1024 * 1024;

/// Ids shorter than this (after normalization) are never loosely matched
const MIN_LOOSE_LEN: usize = 4;

/// One place a deployment directory may live
#[async_trait]
pub trait LookupTier: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, deployment_id: &str) -> Result<Option<PathBuf>, AgentError>;
}

/// `<root>/<deployment_id>/` exists
#[derive(Debug, Clone)]
pub struct ExactMatch {
    label: String,
    root: Dir,
}

impl ExactMatch {
    pub fn new(label: impl Into<String>, root: Dir) -> Self {
        Self {
            label: label.into(),
            root,
        }
    }
}

#[async_trait]
impl LookupTier for ExactMatch {
    fn name(&self) -> &str {
        &self.label
    }

    async fn lookup(&self, deployment_id: &str) -> Result<Option<PathBuf>, AgentError> {
        let dir = self.root.subdir(deployment_id);
        if dir.exists().await {
            return Ok(Some(dir.path().to_path_buf()));
        }
        Ok(None)
    }
}

/// Scan every directory under every root for a loose match of the id in the
/// directory name, a state file's name, or a state file's content
#[derive(Debug, Clone)]
pub struct LooseScan {
    roots: Vec<Dir>,
}

impl LooseScan {
    pub fn new(roots: Vec<Dir>) -> Self {
        Self { roots }
    }

    async fn matches(&self, dir: &Dir, needle: &str) -> Result<bool, AgentError> {
        if dir.name().map(normalize_loose).as_deref() == Some(needle) {
            return Ok(true);
        }

        for path in dir.list_files().await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_state_file(name) {
                continue;
            }
            if normalize_loose(name).contains(needle) {
                return Ok(true);
            }
            let file = File::new(&path);
            match file.size().await {
                Some(size) if size <= MAX_SCAN_BYTES => {}
                _ => continue,
            }
            // Unreadable state is skipped, not fatal to the scan
            if let Ok(content) = file.read_string().await {
                if normalize_loose(&content).contains(needle) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn is_state_file(name: &str) -> bool {
    name == STATE_FILE || name.ends_with(".tfstate") || name.ends_with(".tfstate.backup")
}

#[async_trait]
impl LookupTier for LooseScan {
    fn name(&self) -> &str {
        "loose-scan"
    }

    async fn lookup(&self, deployment_id: &str) -> Result<Option<PathBuf>, AgentError> {
        let needle = normalize_loose(deployment_id);
        if needle.len() < MIN_LOOSE_LEN {
            return Ok(None);
        }

        for root in &self.roots {
            for path in root.list_dirs().await? {
                let dir = Dir::new(path);
                if self.matches(&dir, &needle).await? {
                    debug!(
                        "Loose match for '{}' at {}",
                        deployment_id,
                        dir.path().display()
                    );
                    return Ok(Some(dir.path().to_path_buf()));
                }
            }
        }
        Ok(None)
    }
}
