//! Runnable orchestration
//!
//! The [`Manager`] owns every registered [`Runnable`] and runs them as two
//! groups:
//!
//! - **always-start** units (probes, metrics, webhook) are spawned as soon as
//!   `run` is called, on every replica.
//! - **leadership-gated** units (reconcilers, the lease coordinator) are
//!   spawned together once the leadership gate reports this process as
//!   leader. There is no ordering among them.
//!
//! The first unit error cancels the shared token, every unit is joined and
//! the error is returned unchanged. Cancelling the parent token shuts down
//! cleanly. Joining is bounded by the graceful shutdown timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_GRACEFUL_SHUTDOWN_SECS;
use crate::leader_election::{Leadership, SharedGate};
use crate::metrics::ManagerMetrics;
use crate::runnable::Runnable;
use crate::{Error, Result};

/// Manager lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Nothing registered yet
    Created,
    /// At least one runnable registered
    Registering,
    /// `run` has been called
    Running,
    /// Cancellation observed, waiting for runnables to stop
    ShuttingDown,
    /// Clean shutdown finished
    Stopped,
    /// A runnable failed; the manager cannot be restarted
    Faulted,
}

impl ManagerState {
    fn accepts_registration(self) -> bool {
        matches!(self, Self::Created | Self::Registering)
    }
}

type TaskResult = (String, Result<()>);

/// Spawned units plus their names, so panics can be attributed
#[derive(Default)]
struct Tasks {
    set: JoinSet<TaskResult>,
    names: HashMap<Id, String>,
}

impl Tasks {
    /// Next finished unit as `(name, result)`; panics become runnable errors
    async fn join_next(&mut self) -> Option<TaskResult> {
        let joined = self.set.join_next_with_id().await?;
        Some(match joined {
            Ok((id, (_, result))) => {
                let name = self.names.remove(&id).unwrap_or_default();
                (name, result)
            }
            Err(join_err) => {
                let name = self.names.remove(&join_err.id()).unwrap_or_default();
                let message = if join_err.is_cancelled() {
                    "aborted".to_string()
                } else {
                    "panicked".to_string()
                };
                let err = Error::runnable(name.clone(), message);
                (name, Err(err))
            }
        })
    }
}

/// Owns and runs the process's long-running units
pub struct Manager {
    always: Vec<Box<dyn Runnable>>,
    gated: Vec<Box<dyn Runnable>>,
    gate: Option<SharedGate>,
    graceful_shutdown_timeout: Duration,
    metrics: Option<Arc<ManagerMetrics>>,
    state: watch::Sender<ManagerState>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// Create a manager without leader election
    pub fn new() -> Self {
        let (state, _) = watch::channel(ManagerState::Created);
        Self {
            always: Vec::new(),
            gated: Vec::new(),
            gate: None,
            graceful_shutdown_timeout: Duration::from_secs(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
            metrics: None,
            state,
        }
    }

    /// Gate leadership-gated units on `gate`
    pub fn with_leader_election(mut self, gate: SharedGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Bound the time runnables get to stop
    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    /// Record lifecycle metrics into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<ManagerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Metrics the manager records into, if any
    pub fn metrics(&self) -> Option<Arc<ManagerMetrics>> {
        self.metrics.clone()
    }

    /// Current state
    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// Add a runnable; fails once `run` has begun
    pub fn register(&mut self, unit: Box<dyn Runnable>) -> Result<()> {
        let state = self.state();
        if !state.accepts_registration() {
            return Err(Error::AlreadyStarted(format!("register {}", unit.name())));
        }

        debug!(
            runnable = unit.name(),
            leader_election = unit.needs_leader_election(),
            "Registering runnable"
        );
        if unit.needs_leader_election() {
            self.gated.push(unit);
        } else {
            self.always.push(unit);
        }
        self.state.send_replace(ManagerState::Registering);
        Ok(())
    }

    /// Run every registered unit until `parent` is cancelled or a unit fails
    pub async fn run(&mut self, parent: CancellationToken) -> Result<()> {
        let state = self.state();
        if !state.accepts_registration() {
            return Err(Error::AlreadyStarted("run".to_string()));
        }
        self.state.send_replace(ManagerState::Running);

        let token = parent.child_token();
        let mut tasks = Tasks::default();

        info!(
            always = self.always.len(),
            gated = self.gated.len(),
            leader_election = self.gate.is_some(),
            "Starting manager"
        );

        for unit in std::mem::take(&mut self.always) {
            self.spawn(&mut tasks, unit, &token);
        }

        let mut gated = std::mem::take(&mut self.gated);
        let mut leadership: Option<Box<dyn Leadership>> = None;
        let gate = self.gate.clone();
        let campaign = async move {
            match gate {
                Some(gate) => gate.acquire().await.map(Some),
                None => Ok(None),
            }
        };
        tokio::pin!(campaign);
        let mut campaigning = true;

        let outcome: Result<()> = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Stopping and waiting for runnables");
                    break Ok(());
                }
                acquired = &mut campaign, if campaigning => {
                    campaigning = false;
                    match acquired {
                        Ok(held) => {
                            if held.is_some() {
                                info!("Leader elected, starting leadership-gated runnables");
                                self.record(|m| m.set_leader(true));
                            }
                            leadership = held;
                            for unit in gated.drain(..) {
                                self.spawn(&mut tasks, unit, &token);
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Leader election failed");
                            break Err(e);
                        }
                    }
                }
                _ = wait_lost(&mut leadership), if leadership.is_some() => {
                    error!("Leader election lost");
                    self.record(|m| m.set_leader(false));
                    // a lost lease cannot be released
                    leadership = None;
                    break Err(Error::LeadershipLost);
                }
                Some((name, result)) = tasks.join_next() => {
                    match result {
                        Ok(()) => debug!(runnable = %name, "Runnable returned"),
                        Err(e) => {
                            error!(runnable = %name, error = %e, "Runnable failed");
                            self.record(ManagerMetrics::record_failure);
                            break Err(e);
                        }
                    }
                }
            }
        };

        let next = if outcome.is_ok() {
            ManagerState::ShuttingDown
        } else {
            ManagerState::Faulted
        };
        self.state.send_replace(next);

        token.cancel();
        self.join_all(&mut tasks).await;

        if let Some(held) = leadership.take() {
            self.record(|m| m.set_leader(false));
            if let Err(e) = held.release().await {
                warn!(error = %e, "Failed to release leadership");
            }
        }

        match outcome {
            Ok(()) => {
                self.state.send_replace(ManagerState::Stopped);
                info!("All runnables stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn record(&self, f: impl FnOnce(&ManagerMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    fn spawn(&self, tasks: &mut Tasks, unit: Box<dyn Runnable>, token: &CancellationToken) {
        let token = token.clone();
        let name = unit.name().to_string();
        debug!(runnable = %name, "Starting runnable");
        self.record(ManagerMetrics::record_started);
        let task_name = name.clone();
        let handle = tasks.set.spawn(async move {
            let result = unit.start(token).await;
            (task_name, result)
        });
        tasks.names.insert(handle.id(), name);
    }

    /// Wait for every task, aborting the rest after the grace period
    async fn join_all(&self, tasks: &mut Tasks) {
        let drain = async {
            while let Some((name, result)) = tasks.join_next().await {
                match result {
                    Ok(()) => debug!(runnable = %name, "Runnable stopped"),
                    Err(e) => warn!(runnable = %name, error = %e, "Runnable failed during shutdown"),
                }
            }
        };

        if tokio::time::timeout(self.graceful_shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.graceful_shutdown_timeout.as_secs(),
                remaining = ?tasks.names.values().collect::<Vec<_>>(),
                "Runnables did not stop within the grace period, aborting"
            );
            tasks.set.abort_all();
            while tasks.set.join_next().await.is_some() {}
        }
    }
}

async fn wait_lost(leadership: &mut Option<Box<dyn Leadership>>) {
    match leadership {
        Some(held) => held.lost().await,
        None => std::future::pending::<()>().await,
    }
}
