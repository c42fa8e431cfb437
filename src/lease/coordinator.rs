//! Lazily constructed lease coordinator
//!
//! The coordinator needs a client and must only exist on the leader, so it
//! is built by a leadership-gated runnable and published through a
//! write-once [`LeaseCoordinatorHandle`]. Readers that arrive before
//! publication get [`LeaseError::NotReady`] and are expected to back off.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{KubeLeaseManager, LeaseError, LeaseManager};
use crate::config::ProcessIdentity;
use crate::metrics::ManagerMetrics;
use crate::runnable::Runnable;
use crate::{Error, Result};

/// Shared, write-once slot for the lease coordinator
#[derive(Clone, Default)]
pub struct LeaseCoordinatorHandle {
    slot: Arc<OnceLock<Arc<dyn LeaseManager>>>,
}

impl LeaseCoordinatorHandle {
    /// Create an empty handle
    pub fn new() -> Self {
        Self::default()
    }

    /// The coordinator, or `NotReady` if it has not been published
    pub fn get(&self) -> std::result::Result<Arc<dyn LeaseManager>, LeaseError> {
        self.slot.get().cloned().ok_or(LeaseError::NotReady)
    }

    /// Whether the coordinator has been published
    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Publish the coordinator; fails if one was already published
    pub fn publish(&self, manager: Arc<dyn LeaseManager>) -> Result<()> {
        self.slot
            .set(manager)
            .map_err(|_| Error::LeaseCoordinator("coordinator already published".to_string()))
    }
}

impl std::fmt::Debug for LeaseCoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCoordinatorHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[async_trait]
impl LeaseManager for LeaseCoordinatorHandle {
    async fn acquire(&self, resource: &str, duration: Duration) -> std::result::Result<(), LeaseError> {
        self.get()?.acquire(resource, duration).await
    }

    async fn renew(&self, resource: &str, duration: Duration) -> std::result::Result<(), LeaseError> {
        self.get()?.renew(resource, duration).await
    }

    async fn release(&self, resource: &str) -> std::result::Result<(), LeaseError> {
        self.get()?.release(resource).await
    }
}

/// Builds the concrete lease coordinator
#[async_trait]
pub trait LeaseManagerFactory: Send + Sync {
    /// Construct a coordinator that claims leases as `holder`
    async fn build(&self, holder: ProcessIdentity) -> Result<Arc<dyn LeaseManager>>;
}

/// Factory for [`KubeLeaseManager`]
pub struct KubeLeaseManagerFactory {
    client: Client,
}

impl KubeLeaseManagerFactory {
    /// Create a factory using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LeaseManagerFactory for KubeLeaseManagerFactory {
    async fn build(&self, holder: ProcessIdentity) -> Result<Arc<dyn LeaseManager>> {
        let manager = KubeLeaseManager::new(self.client.clone(), holder)
            .await
            .map_err(|e| Error::LeaseCoordinator(e.to_string()))?;
        Ok(Arc::new(manager))
    }
}

/// Leadership-gated runnable that constructs and publishes the coordinator
pub struct LeaseCoordinatorInitializer {
    factory: Box<dyn LeaseManagerFactory>,
    holder: ProcessIdentity,
    handle: LeaseCoordinatorHandle,
    metrics: Option<Arc<ManagerMetrics>>,
}

impl LeaseCoordinatorInitializer {
    /// Create an initializer publishing into `handle`
    pub fn new(
        factory: Box<dyn LeaseManagerFactory>,
        holder: ProcessIdentity,
        handle: LeaseCoordinatorHandle,
    ) -> Self {
        Self {
            factory,
            holder,
            handle,
            metrics: None,
        }
    }

    /// Report readiness through the manager metrics
    pub fn with_metrics(mut self, metrics: Arc<ManagerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle readers should use
    pub fn handle(&self) -> LeaseCoordinatorHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Runnable for LeaseCoordinatorInitializer {
    fn name(&self) -> &str {
        "lease-coordinator"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let manager = self.factory.build(self.holder.clone()).await?;
        self.handle.publish(manager)?;
        if let Some(metrics) = &self.metrics {
            metrics.set_lease_coordinator_ready(true);
        }
        info!(holder = %self.holder, "Lease coordinator ready");

        shutdown.cancelled().await;
        Ok(())
    }
}
