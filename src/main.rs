//! Node maintenance operator manager

use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tracing::{error, info};

use node_maintenance::config::{Cli, Config};
use node_maintenance::maintenance::NodeMaintenanceHooks;
use node_maintenance::setup::{build_manager, exit_status};
use node_maintenance::{signal, telemetry};

#[tokio::main]
async fn main() -> ExitCode {
    // Every TLS listener and the kube client share this provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install aws-lc-rs crypto provider: {:?}", e);
        return ExitCode::FAILURE;
    }

    let config = match Config::from_cli(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    telemetry::init(&config.logging);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        identity = %config.identity,
        "Starting node maintenance operator"
    );

    let outcome = run(config).await;
    match &outcome {
        Ok(()) => info!("Manager stopped"),
        Err(e) => error!(error = %format!("{:#}", e), "Manager exited with error"),
    }
    ExitCode::from(exit_status(&outcome))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = signal::shutdown_token().context("unable to install signal handlers")?;

    let client = Client::try_default()
        .await
        .context("unable to create kubernetes client")?;

    let mut manager = build_manager(&config, client, &NodeMaintenanceHooks)
        .await
        .context("unable to set up manager")?;

    info!("Starting manager");
    manager
        .run(shutdown)
        .await
        .context("problem running manager")
}
