//! Read-only view of the tool's state file

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::registry::STATE_FILE;
use crate::registry::tiers::MAX_SCAN_BYTES;

#[derive(Debug, Clone, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub resources: Vec<StateResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateResource {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub instances: Vec<StateInstance>,
}

fn default_mode() -> String {
    "managed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateInstance {
    #[serde(default)]
    pub index_key: Option<Value>,
    #[serde(default)]
    pub attributes: Value,
}

/// An instance of a managed resource
#[derive(Debug, Clone)]
pub struct StateEntry<'a> {
    pub address: String,
    pub resource_type: &'a str,
    pub attributes: &'a Value,
}

impl StateSnapshot {
    /// Load `<dir>/terraform.tfstate`; `None` when absent or empty
    pub async fn load(dir: &Path) -> Result<Option<Self>, AgentError> {
        let file = File::new(dir.join(STATE_FILE));
        match file.size().await {
            None | Some(0) => return Ok(None),
            Some(size) if size > MAX_SCAN_BYTES => {
                return Err(AgentError::StorageError(format!(
                    "state file {} too large ({} bytes)",
                    file.path().display(),
                    size
                )))
            }
            Some(_) => {}
        }
        file.read_json().await.map(Some)
    }

    pub fn parse(content: &str) -> Result<Self, AgentError> {
        serde_json::from_str(content)
            .map_err(|e| AgentError::StorageError(format!("corrupt state: {}", e)))
    }

    /// Managed resource instances with their addresses
    pub fn entries(&self) -> Vec<StateEntry<'_>> {
        let mut entries = Vec::new();
        for resource in self.resources.iter().filter(|r| r.mode == "managed") {
            let prefix = match &resource.module {
                Some(module) => format!("{}.", module),
                None => String::new(),
            };
            let base = format!("{}{}.{}", prefix, resource.resource_type, resource.name);
            for instance in &resource.instances {
                let address = match &instance.index_key {
                    Some(Value::Number(n)) => format!("{}[{}]", base, n),
                    Some(Value::String(s)) => format!("{}[\"{}\"]", base, s),
                    _ => base.clone(),
                };
                entries.push(StateEntry {
                    address,
                    resource_type: &resource.resource_type,
                    attributes: &instance.attributes,
                });
            }
        }
        entries
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.address).collect()
    }
}
