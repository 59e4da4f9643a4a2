//! Server state

use std::sync::Arc;

use crate::cluster::discovery::ClusterDiscoveryService;
use crate::collect::ParameterCollector;
use crate::deploy::tracker::DeploymentTracker;
use crate::recovery::RecoveryCoordinator;

/// Server state shared across handlers
pub struct ServerState {
    pub collector: Arc<ParameterCollector>,
    pub tracker: Arc<DeploymentTracker>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub discovery: Arc<ClusterDiscoveryService>,
}

impl ServerState {
    pub fn new(
        collector: Arc<ParameterCollector>,
        tracker: Arc<DeploymentTracker>,
        recovery: Arc<RecoveryCoordinator>,
        discovery: Arc<ClusterDiscoveryService>,
    ) -> Self {
        Self {
            collector,
            tracker,
            recovery,
            discovery,
        }
    }
}
