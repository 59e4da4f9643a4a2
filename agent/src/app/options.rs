//! Application configuration options

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::tracker::TrackerOptions;
use crate::recovery::RecoveryOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{RecoverySettings, Settings};
use crate::workers::health;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Provisioning tool invocation
    pub tool: ToolOptions,

    /// Deployment tracker
    pub tracker: TrackerOptions,

    /// Cluster discovery
    pub discovery: DiscoveryOptions,

    /// Health worker options
    pub health_worker: health::Options,

    /// Retry bounds and backoff
    pub recovery: RecoveryOptions,

    /// Which parameters recovery may adjust, and to what
    pub recovery_policy: RecoverySettings,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            enable_server: true,
            server: ServerOptions::default(),
            tool: ToolOptions::default(),
            tracker: TrackerOptions::default(),
            discovery: DiscoveryOptions::default(),
            health_worker: health::Options::default(),
            recovery: RecoveryOptions::default(),
            recovery_policy: RecoverySettings::default(),
        }
    }
}

impl AppOptions {
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        let defaults = RecoveryOptions::default();
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions {
                layout,
                legacy_roots: settings.storage.legacy_roots.clone(),
            },
            enable_server: settings.enable_server,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            tool: ToolOptions {
                binary: settings.tool.binary.clone(),
                env: settings.tool.env.clone(),
            },
            tracker: TrackerOptions {
                poll_ceiling: Duration::from_secs(settings.tracker.poll_ceiling_secs),
                tail_lines: settings.tracker.output_tail_lines,
            },
            discovery: DiscoveryOptions {
                freshness_window: Duration::from_secs(settings.discovery.freshness_window_secs),
                cache_capacity: settings.discovery.cache_capacity,
                health_check_timeout: Duration::from_secs(
                    settings.discovery.health_check_timeout_secs,
                ),
            },
            health_worker: health::Options {
                interval: Duration::from_secs(settings.discovery.health_check_interval_secs),
            },
            recovery: RecoveryOptions {
                max_attempts: settings.recovery.max_attempts,
                backoff: defaults.backoff,
            },
            recovery_policy: settings.recovery.clone(),
        }
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,

    /// How long shutdown waits for running deployments
    pub deployment_drain_timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30 * 60),
            deployment_drain_timeout: Duration::from_secs(25 * 60),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Roots of earlier releases, consulted read-only
    pub legacy_roots: Vec<PathBuf>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            legacy_roots: Vec::new(),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8480,
        }
    }
}

/// Provisioning tool options
#[derive(Debug, Clone)]
pub struct ToolOptions {
    pub binary: String,
    pub env: BTreeMap<String, String>,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            env: BTreeMap::new(),
        }
    }
}

/// Cluster discovery options
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub freshness_window: Duration,
    pub cache_capacity: u64,
    pub health_check_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(300),
            cache_capacity: 32,
            health_check_timeout: Duration::from_secs(10),
        }
    }
}
