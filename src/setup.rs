//! Manager assembly
//!
//! Builds the [`Manager`] from [`Config`]: leadership gate, probes, metrics,
//! webhook server, lease coordinator initializer and whatever reconcilers and
//! admission routes the [`SetupHooks`] contribute. Any failure here is a
//! setup error and ends the process.

use std::path::Path;
use std::sync::Arc;

use kube::Client;
use tracing::info;

use crate::config::{pod_namespace, Config, ProcessIdentity};
use crate::health::{ping, HealthProbes, HealthServer};
use crate::leader_election::LeaderElector;
use crate::lease::coordinator::KubeLeaseManagerFactory;
use crate::lease::{LeaseCoordinatorHandle, LeaseCoordinatorInitializer};
use crate::manager::Manager;
use crate::metrics::{ManagerMetrics, MetricsServer};
use crate::platform;
use crate::runnable::Runnable;
use crate::webhook::tls::WEBHOOK_CERT_DIR;
use crate::webhook::{configure_webhook_tls, WebhookServer};
use crate::Result;

/// What setup hooks get to see
#[derive(Clone)]
pub struct SetupContext {
    /// Kubernetes client
    pub client: Client,
    /// Identity of this process
    pub identity: ProcessIdentity,
    /// Lease coordinator handle; not ready until leadership is held
    pub leases: LeaseCoordinatorHandle,
    /// Whether the cluster is OpenShift
    pub is_openshift: bool,
}

/// Registration hooks for the business logic
pub trait SetupHooks: Send + Sync {
    /// Build the reconciler runnable
    fn reconciler(&self, ctx: &SetupContext) -> Result<Box<dyn Runnable>>;

    /// Register admission routes on the webhook server
    fn webhooks(&self, ctx: &SetupContext, server: &mut WebhookServer) -> Result<()>;
}

/// Namespace for the leader election lease
///
/// Explicit flag, then the pod's own namespace, then the client default.
pub fn leader_election_namespace(config: &Config, client: &Client) -> String {
    config
        .options
        .leader_election_namespace
        .clone()
        .or_else(pod_namespace)
        .unwrap_or_else(|| client.default_namespace().to_string())
}

/// Process exit status for a finished run
///
/// 0 after a clean shutdown, 1 for any setup or runtime failure.
pub fn exit_status<E>(outcome: &std::result::Result<(), E>) -> u8 {
    match outcome {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Assemble the manager
pub async fn build_manager(
    config: &Config,
    client: Client,
    hooks: &dyn SetupHooks,
) -> Result<Manager> {
    let options = &config.options;
    let metrics = Arc::new(ManagerMetrics::new()?);

    let mut manager = Manager::new()
        .with_graceful_shutdown_timeout(options.graceful_shutdown_timeout)
        .with_metrics(metrics.clone());

    if options.leader_election {
        let namespace = leader_election_namespace(config, &client);
        info!(
            lease = options.leader_election_id,
            namespace = %namespace,
            "Leader election enabled"
        );
        let elector = LeaderElector::new(
            client.clone(),
            options.leader_election_id,
            &namespace,
            config.identity.clone(),
        );
        manager = manager.with_leader_election(Arc::new(elector));
    }

    let leases = LeaseCoordinatorHandle::new();
    let initializer = LeaseCoordinatorInitializer::new(
        Box::new(KubeLeaseManagerFactory::new(client.clone())),
        config.identity.clone(),
        leases.clone(),
    )
    .with_metrics(metrics.clone());
    manager.register(Box::new(initializer))?;

    let is_openshift = platform::is_openshift(&client).await?;
    if is_openshift {
        info!("Node maintenance operator was installed on an OpenShift cluster");
    }

    let ctx = SetupContext {
        client,
        identity: config.identity.clone(),
        leases,
        is_openshift,
    };

    manager.register(hooks.reconciler(&ctx)?)?;

    let tls = configure_webhook_tls(Path::new(WEBHOOK_CERT_DIR), options.enable_http2);
    let mut webhook = WebhookServer::new(options.webhook_port, tls);
    hooks.webhooks(&ctx, &mut webhook)?;
    manager.register(Box::new(webhook))?;

    let mut probes = HealthProbes::new();
    probes.add_healthz_check("healthz", ping())?;
    probes.add_readyz_check("readyz", ping())?;
    if let Some(addr) = options.health_probe_bind_address {
        manager.register(Box::new(HealthServer::new(addr, probes)))?;
    }

    if let Some(addr) = options.metrics_bind_address {
        manager.register(Box::new(MetricsServer::new(addr, metrics)))?;
    }

    Ok(manager)
}
