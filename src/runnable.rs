//! Long-running units managed by the [`Manager`](crate::manager::Manager)

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// A unit of work that runs until cancelled or until it fails
///
/// `start` either returns an error (the manager treats it as fatal), returns
/// `Ok(())` after observing cancellation, or blocks until then.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Whether the unit must wait for this process to win leader election
    ///
    /// Servers that answer probes and admission requests return `false` so
    /// standby replicas stay reachable.
    fn needs_leader_election(&self) -> bool {
        true
    }

    /// Run the unit until `shutdown` is cancelled
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;
}
