//! Leader election using Kubernetes Leases
//!
//! Only one replica runs the leadership-gated units at a time. The leader
//! holds a Lease named by the election id and renews it in the background;
//! if it cannot renew within the renew deadline it reports the loss and the
//! manager shuts the process down. A crashed leader's lease simply expires
//! and a standby takes it over.
//!
//! # Atomicity
//!
//! Writes go through [`LeaseStore`], which uses resourceVersion for
//! compare-and-swap. Two replicas racing for an expired lease cannot both win.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProcessIdentity;
use crate::lease::{AcquireOutcome, LeaseError, LeaseStore, ReleaseOutcome};
use crate::Result;

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Waits for this process to become the cluster-wide leader
#[async_trait]
pub trait LeadershipGate: Send + Sync {
    /// Block until leadership is held
    ///
    /// Dropping the returned future stops campaigning.
    async fn acquire(&self) -> Result<Box<dyn Leadership>>;
}

/// Held leadership
#[async_trait]
pub trait Leadership: Send {
    /// Resolve once leadership has been lost
    async fn lost(&mut self);

    /// Give up leadership so a standby can take over without waiting for expiry
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Lease timing
#[derive(Debug, Clone, Copy)]
pub struct ElectionTiming {
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_interval: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_interval: RETRY_INTERVAL,
        }
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    store: LeaseStore,
    lease_name: String,
    identity: ProcessIdentity,
    timing: ElectionTiming,
}

impl LeaderElector {
    /// Create a new leader elector with default timing
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: ProcessIdentity) -> Self {
        Self {
            store: LeaseStore::new(client, namespace),
            lease_name: lease_name.to_string(),
            identity,
            timing: ElectionTiming::default(),
        }
    }

    /// Override lease timing
    pub fn with_timing(mut self, timing: ElectionTiming) -> Self {
        self.timing = timing;
        self
    }
}

#[async_trait]
impl LeadershipGate for LeaderElector {
    async fn acquire(&self) -> Result<Box<dyn Leadership>> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.store.namespace(),
            "Attempting to acquire leader lease..."
        );

        loop {
            match self
                .store
                .try_acquire_or_renew(
                    &self.lease_name,
                    self.identity.as_str(),
                    self.timing.lease_duration,
                )
                .await
            {
                Ok(outcome) if outcome.is_held() => {
                    info!(identity = %self.identity, "Successfully acquired lease");
                    return Ok(Box::new(LeaderGuard::spawn(
                        self.store.clone(),
                        self.lease_name.clone(),
                        self.identity.clone(),
                        self.timing,
                    )));
                }
                Ok(AcquireOutcome::Held { holder }) => {
                    debug!(identity = %self.identity, %holder, "Lease held by another, waiting...");
                }
                Ok(_) => {
                    debug!(identity = %self.identity, "Lease contended, waiting...");
                }
                Err(e) => {
                    // Transient API errors must not stop campaigning
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.timing.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.timing.retry_interval).await;
        }
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    store: LeaseStore,
    lease_name: String,
    identity: ProcessIdentity,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    fn spawn(
        store: LeaseStore,
        lease_name: String,
        identity: ProcessIdentity,
        timing: ElectionTiming,
    ) -> Self {
        let (lost_tx, lost_rx) = oneshot::channel();
        let renewal_task = tokio::spawn(renewal_loop(
            store.clone(),
            lease_name.clone(),
            identity.clone(),
            timing,
            lost_tx,
        ));

        Self {
            store,
            lease_name,
            identity,
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }
}

/// Renew until a renewal has not succeeded within the renew deadline
async fn renewal_loop(
    store: LeaseStore,
    lease_name: String,
    identity: ProcessIdentity,
    timing: ElectionTiming,
    lost_tx: oneshot::Sender<()>,
) {
    let mut last_renewed = Instant::now();
    loop {
        tokio::time::sleep(timing.retry_interval).await;

        match store
            .renew(&lease_name, identity.as_str(), timing.lease_duration)
            .await
        {
            Ok(AcquireOutcome::Renewed) => {
                last_renewed = Instant::now();
                continue;
            }
            Ok(AcquireOutcome::Held { holder }) => {
                warn!(%identity, %holder, "Lease taken by another holder");
                break;
            }
            Ok(_) => {
                debug!(%identity, "Lease renewal contended");
            }
            Err(e) => {
                warn!(%identity, error = %e, "Failed to renew lease");
            }
        }

        if last_renewed.elapsed() >= timing.renew_deadline {
            warn!(%identity, "Failed to renew lease within deadline");
            break;
        }
    }

    warn!(%identity, "Leadership lost");
    let _ = lost_tx.send(());
}

#[async_trait]
impl Leadership for LeaderGuard {
    async fn lost(&mut self) {
        // the receiver stays in place if this future is dropped mid-wait
        if let Some(rx) = self.lost_rx.as_mut() {
            let _ = rx.await;
            self.lost_rx = None;
            return;
        }
        std::future::pending::<()>().await
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.renewal_task.abort();
        match self
            .store
            .release(&self.lease_name, self.identity.as_str())
            .await?
        {
            ReleaseOutcome::Conflict => Err(LeaseError::Conflict {
                resource: self.lease_name.clone(),
            }
            .into()),
            ReleaseOutcome::Released | ReleaseOutcome::NotHeld => Ok(()),
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

/// Gate that is always open, for single-replica runs and tests
#[derive(Debug, Default, Clone)]
pub struct NoLeaderElection;

struct AlwaysLeader;

#[async_trait]
impl Leadership for AlwaysLeader {
    async fn lost(&mut self) {
        std::future::pending::<()>().await
    }

    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LeadershipGate for NoLeaderElection {
    async fn acquire(&self) -> Result<Box<dyn Leadership>> {
        Ok(Box::new(AlwaysLeader))
    }
}

/// Shared gate as used by the manager
pub type SharedGate = Arc<dyn LeadershipGate>;
