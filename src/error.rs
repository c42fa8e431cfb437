//! Error types for the maintenance manager
//!
//! Errors fall into two groups. Setup errors happen before the manager runs
//! (configuration, client construction, registration) and always end the
//! process. Runtime errors are returned by a running unit and fault the
//! manager, which cancels every other unit before handing the error back.

use thiserror::Error;

use crate::lease::LeaseError;

/// Main error type for manager operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid command line or environment configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure while wiring the manager (client, registration, discovery)
    #[error("setup error [{context}]: {message}")]
    Setup {
        /// What was being set up (e.g., "webhook", "controller", "health")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Lease operation error
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    /// The lease coordinator could not be constructed
    #[error("lease coordinator initialization failed: {0}")]
    LeaseCoordinator(String),

    /// Webhook TLS material could not be loaded
    #[error("tls error: {0}")]
    Tls(String),

    /// A listener failed to bind or serve
    #[error("server error [{server}]: {message}")]
    Server {
        /// Server name (health, metrics, webhook)
        server: String,
        /// Description of what failed
        message: String,
    },

    /// Leadership was held and then lost while running
    #[error("leader election lost")]
    LeadershipLost,

    /// Registration or run attempted after the manager started
    #[error("manager already started, cannot {0}")]
    AlreadyStarted(String),

    /// A health or readiness check with this name already exists
    #[error("duplicate {kind} check: {name}")]
    DuplicateCheck {
        /// "healthz" or "readyz"
        kind: String,
        /// Check name
        name: String,
    },

    /// A runnable failed for a reason not covered by another variant
    #[error("runnable {name} failed: {message}")]
    Runnable {
        /// Runnable name
        name: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a setup error with context
    pub fn setup(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Setup {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a server error
    pub fn server(server: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Server {
            server: server.into(),
            message: msg.into(),
        }
    }

    /// Create a runnable error
    pub fn runnable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runnable {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Whether this error belongs to the setup phase
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Setup { .. } | Self::DuplicateCheck { .. }
        )
    }
}
