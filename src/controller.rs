//! Reconciler runnables
//!
//! Wraps a kube-runtime [`Controller`] so the manager can start it once
//! leadership is held and stop it through the shared cancellation token.
//!
//! Reconcilers may run before the lease coordinator is published; there is
//! no barrier between them. [`Context::lease_manager`] reports that case as
//! [`ReconcileError::LeaseNotReady`], which [`requeue_on_lease_not_ready`]
//! turns into a short requeue instead of a failure.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lease::{LeaseCoordinatorHandle, LeaseError, LeaseManager};
use crate::runnable::Runnable;
use crate::{Error, Result};

/// Requeue delay while the lease coordinator is not yet published
pub const LEASE_NOT_READY_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue delay after any other reconcile error
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Errors returned by reconcile functions
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The lease coordinator has not been published yet
    #[error("lease coordinator not ready")]
    LeaseNotReady,

    /// Lease operation failed
    #[error("lease error: {0}")]
    Lease(LeaseError),

    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl From<LeaseError> for ReconcileError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::NotReady => Self::LeaseNotReady,
            other => Self::Lease(other),
        }
    }
}

/// Shared state handed to reconcile functions
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    leases: LeaseCoordinatorHandle,
}

impl Context {
    /// Create a context reading the coordinator from `leases`
    pub fn new(client: Client, leases: LeaseCoordinatorHandle) -> Self {
        Self { client, leases }
    }

    /// The lease coordinator, or [`ReconcileError::LeaseNotReady`]
    pub fn lease_manager(&self) -> std::result::Result<Arc<dyn LeaseManager>, ReconcileError> {
        Ok(self.leases.get()?)
    }

    /// Whether the lease coordinator has been published
    pub fn leases_ready(&self) -> bool {
        self.leases.is_ready()
    }
}

/// Error policy applying the lease readiness rule
///
/// `LeaseNotReady` and retryable lease errors requeue after
/// [`LEASE_NOT_READY_REQUEUE`]; everything else after [`ERROR_REQUEUE`].
pub fn requeue_on_lease_not_ready<K>(
    object: Arc<K>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action
where
    K: Resource,
{
    let name = object.meta().name.as_deref().unwrap_or_default();
    match error {
        ReconcileError::LeaseNotReady => {
            debug!(object = %name, "Lease coordinator not ready, requeueing");
            Action::requeue(LEASE_NOT_READY_REQUEUE)
        }
        ReconcileError::Lease(e) if e.is_retryable() => {
            debug!(object = %name, error = %e, "Lease busy, requeueing");
            Action::requeue(LEASE_NOT_READY_REQUEUE)
        }
        other => {
            warn!(object = %name, error = %other, "Reconcile failed, requeueing");
            Action::requeue(ERROR_REQUEUE)
        }
    }
}

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ControllerBuilder = Box<dyn Fn(CancellationToken) -> ControllerFuture + Send + Sync>;

/// Leadership-gated runnable driving one kube-runtime controller
pub struct ControllerRunnable {
    name: String,
    build: ControllerBuilder,
}

impl ControllerRunnable {
    /// Watch `api` and reconcile every object with `reconcile`
    pub fn new<K, F, Fut, P>(
        name: &str,
        api: Api<K>,
        reconcile: F,
        error_policy: P,
        ctx: Arc<Context>,
    ) -> Self
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default + Debug + Clone + Eq + Hash + Unpin + Send + Sync,
        F: Fn(Arc<K>, Arc<Context>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Action, ReconcileError>> + Send + 'static,
        P: Fn(Arc<K>, &ReconcileError, Arc<Context>) -> Action + Clone + Send + Sync + 'static,
    {
        let controller_name = name.to_string();
        let build: ControllerBuilder = Box::new(move |shutdown: CancellationToken| {
            let name = controller_name.clone();
            Box::pin(
                Controller::new(
                    api.clone(),
                    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
                )
                .graceful_shutdown_on(shutdown.cancelled_owned())
                .run(reconcile.clone(), error_policy.clone(), ctx.clone())
                .for_each(move |result| {
                    match result {
                        Ok((object, action)) => {
                            debug!(controller = %name, object = %object.name, ?action, "Reconciliation completed")
                        }
                        Err(e) => debug!(controller = %name, error = %e, "Reconciliation error"),
                    }
                    std::future::ready(())
                }),
            )
        });

        Self {
            name: name.to_string(),
            build,
        }
    }
}

#[async_trait]
impl Runnable for ControllerRunnable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        info!(controller = %self.name, "Starting controller");
        (self.build)(shutdown.clone()).await;

        if shutdown.is_cancelled() {
            info!(controller = %self.name, "Controller stopped");
            Ok(())
        } else {
            Err(Error::runnable(&self.name, "controller stream ended unexpectedly"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;

    fn node(name: &str) -> Arc<Node> {
        Arc::new(Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn not_ready_maps_to_dedicated_variant() {
        assert!(matches!(
            ReconcileError::from(LeaseError::NotReady),
            ReconcileError::LeaseNotReady
        ));
        assert!(matches!(
            ReconcileError::from(LeaseError::NotHolder {
                resource: "node-a".into()
            }),
            ReconcileError::Lease(_)
        ));
    }

    #[tokio::test]
    async fn error_policy_requeues_quickly_when_not_ready() {
        let ctx = Arc::new(Context::new(
            test_client(),
            LeaseCoordinatorHandle::new(),
        ));
        assert!(!ctx.leases_ready());
        assert!(matches!(ctx.lease_manager(), Err(ReconcileError::LeaseNotReady)));

        let action = requeue_on_lease_not_ready(node("a"), &ReconcileError::LeaseNotReady, ctx.clone());
        assert_eq!(action, Action::requeue(LEASE_NOT_READY_REQUEUE));

        let busy = ReconcileError::Lease(LeaseError::AlreadyHeld {
            resource: "node-a".into(),
            holder: "other".into(),
        });
        let action = requeue_on_lease_not_ready(node("a"), &busy, ctx.clone());
        assert_eq!(action, Action::requeue(LEASE_NOT_READY_REQUEUE));

        let fatal = ReconcileError::Lease(LeaseError::NotHolder {
            resource: "node-a".into(),
        });
        let action = requeue_on_lease_not_ready(node("a"), &fatal, ctx);
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }

    /// Client pointed at an unreachable endpoint; never used for requests
    fn test_client() -> Client {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).unwrap()
    }
}
