//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Also write a daily rolling log file under the layout's logs directory
    #[serde(default = "default_true")]
    pub file_logs: bool,

    /// Enable the command/polling HTTP server
    #[serde(default = "default_true")]
    pub enable_server: bool,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// External provisioning tool
    #[serde(default)]
    pub tool: ToolSettings,

    /// Deployment directory storage
    #[serde(default)]
    pub storage: StorageSettings,

    /// Deployment tracker
    #[serde(default)]
    pub tracker: TrackerSettings,

    /// Cluster discovery and connection caching
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Failure recovery
    #[serde(default)]
    pub recovery: RecoverySettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            file_logs: true,
            enable_server: true,
            server: ServerSettings::default(),
            tool: ToolSettings::default(),
            storage: StorageSettings::default(),
            tracker: TrackerSettings::default(),
            discovery: DiscoverySettings::default(),
            recovery: RecoverySettings::default(),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8480
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Provisioning tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Binary name or path (`terraform`, `tofu`, ...)
    #[serde(default = "default_tool_binary")]
    pub binary: String,

    /// Extra environment passed to every invocation
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_tool_binary() -> String {
    "terraform".to_string()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            binary: default_tool_binary(),
            env: BTreeMap::new(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Roots used by earlier releases; consulted read-only by lookups
    #[serde(default = "default_legacy_roots")]
    pub legacy_roots: Vec<PathBuf>,
}

fn default_legacy_roots() -> Vec<PathBuf> {
    vec![std::env::temp_dir().join("infragent-deployments")]
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            legacy_roots: default_legacy_roots(),
        }
    }
}

/// Tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Callers are told to stop polling a running deployment after this long
    #[serde(default = "default_poll_ceiling")]
    pub poll_ceiling_secs: u64,

    /// Output lines returned by a status poll
    #[serde(default = "default_tail_lines")]
    pub output_tail_lines: usize,
}

fn default_poll_ceiling() -> u64 {
    45 * 60
}

fn default_tail_lines() -> usize {
    40
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            poll_ceiling_secs: default_poll_ceiling(),
            output_tail_lines: default_tail_lines(),
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// A cached connection is reused while its last health check is this recent
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,

    /// Interval of the background health worker
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Maximum cached connections
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// Timeout of a single health check request
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_secs: u64,
}

fn default_freshness_window() -> u64 {
    300
}

fn default_health_interval() -> u64 {
    120
}

fn default_cache_capacity() -> u64 {
    32
}

fn default_health_timeout() -> u64 {
    10
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            freshness_window_secs: default_freshness_window(),
            health_check_interval_secs: default_health_interval(),
            cache_capacity: default_cache_capacity(),
            health_check_timeout_secs: default_health_timeout(),
        }
    }
}

/// Recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Attempts allowed along one retry chain, the first attempt included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Preference-ordered alternatives per parameter name
    #[serde(default = "default_preferences")]
    pub preferences: BTreeMap<String, Vec<String>>,

    /// Parameters a capacity failure may adjust, in order
    #[serde(default = "default_capacity_params")]
    pub capacity_params: Vec<String>,

    /// Parameters a quota failure may adjust, in order
    #[serde(default = "default_quota_params")]
    pub quota_params: Vec<String>,

    /// Parameters a naming conflict may adjust, in order
    #[serde(default = "default_naming_params")]
    pub naming_params: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_preferences() -> BTreeMap<String, Vec<String>> {
    let sizes = vec![
        "Standard_D2s_v3".to_string(),
        "Standard_D2as_v5".to_string(),
        "Standard_B2s".to_string(),
        "Standard_D4s_v3".to_string(),
    ];
    let regions = vec![
        "eastus".to_string(),
        "eastus2".to_string(),
        "westus2".to_string(),
        "centralus".to_string(),
        "westeurope".to_string(),
    ];
    let mut preferences = BTreeMap::new();
    preferences.insert("vm_size".to_string(), sizes.clone());
    preferences.insert("node_vm_size".to_string(), sizes);
    preferences.insert("location".to_string(), regions);
    preferences
}

fn default_capacity_params() -> Vec<String> {
    vec![
        "node_vm_size".to_string(),
        "vm_size".to_string(),
        "location".to_string(),
    ]
}

fn default_quota_params() -> Vec<String> {
    vec![
        "location".to_string(),
        "node_vm_size".to_string(),
        "vm_size".to_string(),
    ]
}

fn default_naming_params() -> Vec<String> {
    vec![
        "cluster_name".to_string(),
        "name".to_string(),
        "name_prefix".to_string(),
        "resource_group_name".to_string(),
        "storage_account_name".to_string(),
    ]
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            preferences: default_preferences(),
            capacity_params: default_capacity_params(),
            quota_params: default_quota_params(),
            naming_params: default_naming_params(),
        }
    }
}

/// Read settings from disk, falling back to defaults when the file is absent
pub async fn load_settings(file: &File) -> Result<Settings, AgentError> {
    match file.read_json_opt::<Settings>().await? {
        Some(settings) => Ok(settings),
        None => Ok(Settings::default()),
    }
}
