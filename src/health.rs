//! Liveness and readiness probes
//!
//! Probes are answered by every replica, leader or not, so a standby is not
//! restarted by the kubelet while it waits for leadership.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::runnable::Runnable;
use crate::{Error, Result};

/// A named probe check
pub type Checker = Arc<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;

/// Check that always passes once the process is serving
pub fn ping() -> Checker {
    Arc::new(|| Ok(()))
}

/// Registered liveness and readiness checks
#[derive(Clone, Default)]
pub struct HealthProbes {
    healthz: BTreeMap<String, Checker>,
    readyz: BTreeMap<String, Checker>,
}

impl HealthProbes {
    /// Create an empty set of checks
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a liveness check
    pub fn add_healthz_check(&mut self, name: &str, check: Checker) -> Result<()> {
        insert_check(&mut self.healthz, "healthz", name, check)
    }

    /// Add a readiness check
    pub fn add_readyz_check(&mut self, name: &str, check: Checker) -> Result<()> {
        insert_check(&mut self.readyz, "readyz", name, check)
    }

    /// Build the probe router
    pub fn routes(self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .with_state(Arc::new(self))
    }
}

fn insert_check(
    checks: &mut BTreeMap<String, Checker>,
    kind: &str,
    name: &str,
    check: Checker,
) -> Result<()> {
    if checks.contains_key(name) {
        return Err(Error::DuplicateCheck {
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }
    checks.insert(name.to_string(), check);
    Ok(())
}

/// Run every check; 200 "ok" if all pass, 500 with the failures otherwise
fn evaluate(kind: &str, checks: &BTreeMap<String, Checker>) -> (StatusCode, String) {
    let failures: Vec<String> = checks
        .iter()
        .filter_map(|(name, check)| check().err().map(|e| format!("[-]{} failed: {}", name, e)))
        .collect();

    if failures.is_empty() {
        (StatusCode::OK, "ok".to_string())
    } else {
        debug!(probe = kind, failures = failures.len(), "Probe check failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n{} check failed", failures.join("\n"), kind),
        )
    }
}

async fn healthz(State(probes): State<Arc<HealthProbes>>) -> (StatusCode, String) {
    evaluate("healthz", &probes.healthz)
}

async fn readyz(State(probes): State<Arc<HealthProbes>>) -> (StatusCode, String) {
    evaluate("readyz", &probes.readyz)
}

/// Serves `/healthz` and `/readyz`
pub struct HealthServer {
    addr: SocketAddr,
    probes: HealthProbes,
}

impl HealthServer {
    /// Create a server for `probes` on `addr`
    pub fn new(addr: SocketAddr, probes: HealthProbes) -> Self {
        Self { addr, probes }
    }
}

#[async_trait]
impl Runnable for HealthServer {
    fn name(&self) -> &str {
        "health-probes"
    }

    fn needs_leader_election(&self) -> bool {
        false
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::server("health", format!("bind {}: {}", self.addr, e)))?;
        info!(addr = %self.addr, "Serving health probes");

        axum::serve(listener, self.probes.clone().routes())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::server("health", e.to_string()))
    }
}
