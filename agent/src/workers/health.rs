//! Cluster connection health worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cluster::discovery::ClusterDiscoveryService;

/// Health worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Check interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Something holding cached connections that can re-check them
#[async_trait]
pub trait CachedHealth: Send + Sync {
    /// (healthy, invalidated)
    async fn check_cached(&self) -> (usize, usize);
}

#[async_trait]
impl CachedHealth for ClusterDiscoveryService {
    async fn check_cached(&self) -> (usize, usize) {
        ClusterDiscoveryService::check_cached(self).await
    }
}

/// Run the health worker
pub async fn run<C, S, F>(
    options: &Options,
    checker: &C,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    C: CachedHealth + ?Sized,
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Health worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Health worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let (healthy, invalidated) = checker.check_cached().await;
        if invalidated > 0 {
            warn!(
                "Invalidated {} cluster connections ({} healthy)",
                invalidated, healthy
            );
        } else {
            debug!("{} cluster connections healthy", healthy);
        }
    }
}
