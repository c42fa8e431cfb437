//! Admission webhook server
//!
//! Serves admission routes registered during setup over HTTPS. The routes
//! themselves (validation of maintenance requests) live with the business
//! logic; this module only owns the listener and its transport security.

pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::MethodRouter;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use tls::{configure_webhook_tls, TlsOption, WebhookTlsConfig};

use crate::runnable::Runnable;
use crate::{Error, Result};

/// Time in-flight admission requests get after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// HTTPS server for admission webhooks; runs on every replica
pub struct WebhookServer {
    addr: SocketAddr,
    tls: WebhookTlsConfig,
    router: Router,
    paths: Vec<String>,
}

impl WebhookServer {
    /// Create a server listening on all interfaces at `port`
    pub fn new(port: u16, tls: WebhookTlsConfig) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            tls,
            router: Router::new(),
            paths: Vec::new(),
        }
    }

    /// Register an admission handler at `path`
    pub fn register(&mut self, path: &str, route: MethodRouter) -> Result<()> {
        if self.paths.iter().any(|p| p == path) {
            return Err(Error::setup(
                "webhook",
                format!("path {} registered twice", path),
            ));
        }
        info!(path, "Registering webhook");
        self.router = std::mem::take(&mut self.router).route(path, route);
        self.paths.push(path.to_string());
        Ok(())
    }

    /// Registered paths
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// TLS configuration the server will use
    pub fn tls(&self) -> &WebhookTlsConfig {
        &self.tls
    }
}

#[async_trait]
impl Runnable for WebhookServer {
    fn name(&self) -> &str {
        "webhook-server"
    }

    fn needs_leader_election(&self) -> bool {
        false
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let server_config = self.tls.build_server_config()?;
        let tls = RustlsConfig::from_config(Arc::new(server_config));

        let paths = self.tls.resolve();
        info!(
            addr = %self.addr,
            cert = %paths.cert.display(),
            "Starting webhook server"
        );

        let handle = axum_server::Handle::new();
        let server = axum_server::bind_rustls(self.addr, tls)
            .handle(handle.clone())
            .serve(self.router.clone().into_make_service());
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => {
                return result.map_err(|e| Error::server("webhook", e.to_string()));
            }
            _ = shutdown.cancelled() => {
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            }
        }

        server
            .await
            .map_err(|e| Error::server("webhook", e.to_string()))
    }
}
