//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::cluster::cache::ConnectionCache;
use crate::cluster::connector::HttpClusterConnector;
use crate::cluster::discovery::ClusterDiscoveryService;
use crate::collect::ParameterCollector;
use crate::deploy::executor::ExecutionEngine;
use crate::deploy::tool::TerraformCli;
use crate::deploy::tracker::DeploymentTracker;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::recovery::alternatives::AlternativePolicy;
use crate::recovery::history::FailureLog;
use crate::recovery::RecoveryCoordinator;
use crate::registry::DirectoryRegistry;
use crate::templates::FsTemplateCatalog;

/// Main application state
pub struct AppState {
    pub registry: Arc<DirectoryRegistry>,

    pub discovery: Arc<ClusterDiscoveryService>,

    pub tracker: Arc<DeploymentTracker>,

    pub recovery: Arc<RecoveryCoordinator>,

    pub collector: Arc<ParameterCollector>,
}

impl AppState {
    /// Wire every component and reload what a previous run left behind
    pub async fn init(options: &AppOptions) -> Result<Self, AgentError> {
        info!("Initializing application state...");

        let layout = &options.storage.layout;
        layout.setup().await?;

        let registry = Arc::new(DirectoryRegistry::new(
            layout.deployments_dir(),
            options.storage.legacy_roots.iter().map(Dir::new).collect(),
        ));

        let discovery = Arc::new(ClusterDiscoveryService::new(
            registry.clone(),
            Arc::new(HttpClusterConnector::new(options.discovery.health_check_timeout)),
            ConnectionCache::new(
                options.discovery.cache_capacity,
                options.discovery.freshness_window,
            ),
        ));

        let catalog = Arc::new(FsTemplateCatalog::new(layout.templates_dir()));
        let tool = Arc::new(TerraformCli::new(
            options.tool.binary.clone(),
            options.tool.env.clone(),
        ));
        let tracker = Arc::new(DeploymentTracker::new(
            options.tracker.clone(),
            registry.clone(),
            catalog.clone(),
            Arc::new(ExecutionEngine::new(tool)),
            Some(discovery.clone()),
        ));

        let failure_log = Arc::new(FailureLog::open(layout.failures_file()).await?);
        let recovery = Arc::new(RecoveryCoordinator::new(
            tracker.clone(),
            failure_log,
            AlternativePolicy::from(&options.recovery_policy),
            options.recovery.clone(),
        ));

        let collector = Arc::new(ParameterCollector::new(catalog, layout.sessions_dir()));

        let loaded = tracker.load_existing().await?;
        let restored = collector.restore().await?;
        info!(
            "Reloaded {} deployments and {} collection sessions",
            loaded, restored
        );

        Ok(Self {
            registry,
            discovery,
            tracker,
            recovery,
            collector,
        })
    }

    /// Wait for running deployments; an apply in flight is never killed
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<(), AgentError> {
        info!("Shutting down application state...");
        if let Err(e) = self.tracker.shutdown(drain_timeout).await {
            warn!("Deployments still running at shutdown: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
