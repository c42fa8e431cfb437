//! Process configuration
//!
//! Flags are parsed once at entry into an immutable [`Config`] that is passed
//! by reference to everything that needs it. Nothing here is global.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::{Error, Result};

/// Leader election resource name shared by every replica
pub const LEADER_ELECTION_ID: &str = "135b1886.medik8s.io";

/// Default port of the admission webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Default time allowed for runnables to stop after cancellation
pub const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;

/// Namespace file mounted into every pod with a service account
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Node maintenance operator manager
#[derive(Parser, Debug, Clone)]
#[command(name = "manager", version, about, long_about = None)]
pub struct Cli {
    /// The address the metric endpoint binds to ("0" disables it)
    #[arg(long, default_value = ":8080")]
    pub metrics_bind_address: String,

    /// The address the probe endpoint binds to ("0" disables it)
    #[arg(long, default_value = ":8081")]
    pub health_probe_bind_address: String,

    /// Enable leader election for controller manager.
    /// Enabling this will ensure there is only one active controller manager.
    #[arg(long, default_value_t = false)]
    pub leader_elect: bool,

    /// Namespace of the leader election lease (defaults to the pod namespace)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    pub leader_election_namespace: Option<String>,

    /// If HTTP/2 should be enabled for the metrics and webhook servers
    #[arg(long, default_value_t = false)]
    pub enable_http2: bool,

    /// Port the admission webhook server listens on
    #[arg(long, default_value_t = DEFAULT_WEBHOOK_PORT)]
    pub webhook_port: u16,

    /// Seconds allowed for runnables to stop after a termination signal
    #[arg(long, default_value_t = DEFAULT_GRACEFUL_SHUTDOWN_SECS)]
    pub graceful_shutdown_timeout: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Output format
    pub format: LogFormat,
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

/// Identity of this process instance
///
/// Used as the leader election holder and as the holder of every
/// per-resource lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessIdentity(String);

impl ProcessIdentity {
    /// Wrap an explicit identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Pod name (or hostname) plus a random suffix
    pub fn generate() -> Self {
        let host = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self(format!("{}_{}", host, uuid::Uuid::new_v4()))
    }

    /// Identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Manager options, fixed at startup
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Metrics listener, `None` when disabled
    pub metrics_bind_address: Option<SocketAddr>,
    /// Health probe listener, `None` when disabled
    pub health_probe_bind_address: Option<SocketAddr>,
    /// Webhook listener port
    pub webhook_port: u16,
    /// Whether leadership-gated units wait for leader election
    pub leader_election: bool,
    /// Leader election lease name
    pub leader_election_id: &'static str,
    /// Leader election lease namespace, `None` to detect
    pub leader_election_namespace: Option<String>,
    /// Whether HTTP/2 may be negotiated on the webhook server
    pub enable_http2: bool,
    /// Time allowed for runnables to stop
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            metrics_bind_address: Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
            health_probe_bind_address: Some(SocketAddr::from(([0, 0, 0, 0], 8081))),
            webhook_port: DEFAULT_WEBHOOK_PORT,
            leader_election: false,
            leader_election_id: LEADER_ELECTION_ID,
            leader_election_namespace: None,
            enable_http2: false,
            graceful_shutdown_timeout: Duration::from_secs(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
        }
    }
}

/// Everything built from the command line
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this process
    pub identity: ProcessIdentity,
    /// Manager options
    pub options: ManagerOptions,
    /// Logging options
    pub logging: LoggingOptions,
}

impl Config {
    /// Build the configuration from parsed flags
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let options = ManagerOptions {
            metrics_bind_address: parse_bind_address(&cli.metrics_bind_address)?,
            health_probe_bind_address: parse_bind_address(&cli.health_probe_bind_address)?,
            webhook_port: cli.webhook_port,
            leader_election: cli.leader_elect,
            leader_election_id: LEADER_ELECTION_ID,
            leader_election_namespace: cli.leader_election_namespace.filter(|ns| !ns.is_empty()),
            enable_http2: cli.enable_http2,
            graceful_shutdown_timeout: Duration::from_secs(cli.graceful_shutdown_timeout),
        };

        Ok(Self {
            identity: ProcessIdentity::generate(),
            options,
            logging: LoggingOptions {
                format: cli.log_format,
                level: cli.log_level,
            },
        })
    }
}

/// Parse a listener address
///
/// Accepts `host:port`, `:port` (all interfaces) and `0` (disabled).
pub fn parse_bind_address(addr: &str) -> Result<Option<SocketAddr>> {
    let addr = addr.trim();
    if addr == "0" || addr.is_empty() {
        return Ok(None);
    }

    let full = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };

    full.parse::<SocketAddr>()
        .map(Some)
        .map_err(|e| Error::Config(format!("invalid bind address {:?}: {}", addr, e)))
}

/// Namespace of the running pod, read from the service account mount
pub fn pod_namespace() -> Option<String> {
    read_namespace_file(Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE))
}

fn read_namespace_file(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
