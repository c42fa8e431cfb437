//! Per-resource leases
//!
//! A lease is a time-bounded exclusive claim on a named resource (for example
//! a node under maintenance), held by one process identity. Other operators
//! in the cluster honor the same records, so a node is never drained by two
//! parties at once.

pub mod coordinator;
pub mod store;

#[cfg(test)]
pub(crate) mod fake_api;

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

pub use coordinator::{LeaseCoordinatorHandle, LeaseCoordinatorInitializer};
pub use store::{AcquireOutcome, LeaseStore, ReleaseOutcome};

use crate::config::ProcessIdentity;

/// Namespace holding the per-resource lease records
pub const LEASE_NAMESPACE: &str = "medik8s-leases";

const FIELD_MANAGER: &str = "node-maintenance-manager";

/// Lease errors
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The lease coordinator has not been constructed yet
    #[error("lease coordinator not ready")]
    NotReady,

    /// Another identity holds an unexpired lease on the resource
    #[error("lease {resource} already held by {holder}")]
    AlreadyHeld {
        /// Lease name
        resource: String,
        /// Current holder
        holder: String,
    },

    /// Renewal attempted on a lease we do not hold
    #[error("lease {resource} is not held by this process")]
    NotHolder {
        /// Lease name
        resource: String,
    },

    /// A concurrent writer won the race; retry later
    #[error("lease {resource} was modified concurrently")]
    Conflict {
        /// Lease name
        resource: String,
    },

    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl LeaseError {
    /// Whether the caller should back off and try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotReady | Self::AlreadyHeld { .. } | Self::Conflict { .. }
        )
    }
}

/// Acquire, renew and release exclusive per-resource leases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Acquire the lease on `resource`, or extend it if already ours
    async fn acquire(&self, resource: &str, duration: Duration) -> Result<(), LeaseError>;

    /// Extend a lease this process already holds
    async fn renew(&self, resource: &str, duration: Duration) -> Result<(), LeaseError>;

    /// Give up the lease; a no-op if we do not hold it
    async fn release(&self, resource: &str) -> Result<(), LeaseError>;
}

/// Build the lease name for an object of `kind` called `name`
pub fn lease_name(kind: &str, name: &str) -> String {
    format!("{}-{}", kind.to_lowercase(), name)
}

/// [`LeaseManager`] backed by Lease objects in [`LEASE_NAMESPACE`]
pub struct KubeLeaseManager {
    store: LeaseStore,
    holder: ProcessIdentity,
}

impl KubeLeaseManager {
    /// Construct the manager, creating the lease namespace if it is missing
    pub async fn new(client: Client, holder: ProcessIdentity) -> Result<Self, LeaseError> {
        let namespaces: Api<Namespace> = Api::all(client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(LEASE_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces
            .patch(
                LEASE_NAMESPACE,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Apply(&ns),
            )
            .await?;
        debug!(namespace = LEASE_NAMESPACE, "Lease namespace ensured");

        Ok(Self {
            store: LeaseStore::new(client, LEASE_NAMESPACE),
            holder,
        })
    }
}

#[async_trait]
impl LeaseManager for KubeLeaseManager {
    async fn acquire(&self, resource: &str, duration: Duration) -> Result<(), LeaseError> {
        match self
            .store
            .try_acquire_or_renew(resource, self.holder.as_str(), duration)
            .await?
        {
            AcquireOutcome::Acquired => {
                info!(lease = resource, holder = %self.holder, "Lease acquired");
                Ok(())
            }
            AcquireOutcome::Renewed => Ok(()),
            AcquireOutcome::Held { holder } => Err(LeaseError::AlreadyHeld {
                resource: resource.to_string(),
                holder,
            }),
            AcquireOutcome::Conflict => Err(LeaseError::Conflict {
                resource: resource.to_string(),
            }),
        }
    }

    async fn renew(&self, resource: &str, duration: Duration) -> Result<(), LeaseError> {
        match self
            .store
            .renew(resource, self.holder.as_str(), duration)
            .await?
        {
            AcquireOutcome::Renewed | AcquireOutcome::Acquired => Ok(()),
            AcquireOutcome::Conflict => Err(LeaseError::Conflict {
                resource: resource.to_string(),
            }),
            AcquireOutcome::Held { .. } => Err(LeaseError::NotHolder {
                resource: resource.to_string(),
            }),
        }
    }

    async fn release(&self, resource: &str) -> Result<(), LeaseError> {
        match self.store.release(resource, self.holder.as_str()).await? {
            ReleaseOutcome::Released | ReleaseOutcome::NotHeld => Ok(()),
            ReleaseOutcome::Conflict => Err(LeaseError::Conflict {
                resource: resource.to_string(),
            }),
        }
    }
}
