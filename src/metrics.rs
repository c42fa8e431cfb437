//! Manager metrics
//!
//! A handful of counters and gauges describing the lifecycle, kept in a
//! private Prometheus registry and served in the text exposition format on
//! the metrics bind address.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::runnable::Runnable;
use crate::{Error, Result};

/// Lifecycle metrics
#[derive(Clone)]
pub struct ManagerMetrics {
    registry: Registry,
    /// Runnables started
    pub runnables_started_total: IntCounter,
    /// Runnables that returned an error
    pub runnable_failures_total: IntCounter,
    /// 1 while this process holds leadership
    pub leader: IntGauge,
    /// 1 once the lease coordinator is published
    pub lease_coordinator_ready: IntGauge,
}

impl std::fmt::Debug for ManagerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerMetrics")
            .field("runnables_started_total", &self.runnables_started_total.get())
            .field("runnable_failures_total", &self.runnable_failures_total.get())
            .field("leader", &self.leader.get())
            .field("lease_coordinator_ready", &self.lease_coordinator_ready.get())
            .finish()
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::setup("metrics", e.to_string())
}

impl ManagerMetrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runnables_started_total = IntCounter::new(
            "manager_runnables_started_total",
            "Runnables started by the manager",
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(runnables_started_total.clone()))
            .map_err(metric_error)?;

        let runnable_failures_total = IntCounter::new(
            "manager_runnable_failures_total",
            "Runnables that returned an error",
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(runnable_failures_total.clone()))
            .map_err(metric_error)?;

        let leader = IntGauge::new(
            "leader_election_master_status",
            "1 if this process is the leader",
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(leader.clone()))
            .map_err(metric_error)?;

        let lease_coordinator_ready = IntGauge::new(
            "lease_coordinator_ready",
            "1 once the lease coordinator is constructed",
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(lease_coordinator_ready.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            runnables_started_total,
            runnable_failures_total,
            leader,
            lease_coordinator_ready,
        })
    }

    /// Record a runnable being spawned
    pub fn record_started(&self) {
        self.runnables_started_total.inc();
    }

    /// Record a runnable returning an error
    pub fn record_failure(&self) {
        self.runnable_failures_total.inc();
    }

    /// Set the leader gauge
    pub fn set_leader(&self, leader: bool) {
        self.leader.set(i64::from(leader));
    }

    /// Set the lease coordinator readiness gauge
    pub fn set_lease_coordinator_ready(&self, ready: bool) {
        self.lease_coordinator_ready.set(i64::from(ready));
    }

    /// Encode the registry in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::server("metrics", e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| Error::server("metrics", e.to_string()))
    }
}

/// Build the metrics router
pub fn metrics_routes(metrics: Arc<ManagerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Arc<ManagerMetrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serves `/metrics`; runs on every replica
pub struct MetricsServer {
    addr: SocketAddr,
    metrics: Arc<ManagerMetrics>,
}

impl MetricsServer {
    /// Create a server for `metrics` on `addr`
    pub fn new(addr: SocketAddr, metrics: Arc<ManagerMetrics>) -> Self {
        Self { addr, metrics }
    }
}

#[async_trait]
impl Runnable for MetricsServer {
    fn name(&self) -> &str {
        "metrics"
    }

    fn needs_leader_election(&self) -> bool {
        false
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::server("metrics", format!("bind {}: {}", self.addr, e)))?;
        info!(addr = %self.addr, "Serving metrics");

        axum::serve(listener, metrics_routes(self.metrics.clone()))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::server("metrics", e.to_string()))
    }
}
