//! Node maintenance operator - process startup and lifecycle
//!
//! Brings up the long-running units of the operator and supervises them:
//! a reconciler, an admission webhook server, probe and metrics endpoints,
//! and the initializer that publishes the shared lease coordinator.
//!
//! # Lifecycle
//!
//! - Units that need leadership start only after the leader election lease
//!   is acquired; the rest start immediately
//! - The first unit failure, or loss of leadership, shuts everything down
//! - A termination signal stops all units within the grace period
//!
//! # Modules
//!
//! - [`manager`] - Runnable orchestration and leadership gating
//! - [`leader_election`] - Lease-based leader election
//! - [`lease`] - Per-resource lease coordination and its initializer
//! - [`webhook`] - Admission webhook server and TLS configuration
//! - [`health`] - Liveness and readiness probes
//! - [`metrics`] - Prometheus metrics endpoint
//! - [`controller`] - Reconciler runnables
//! - [`setup`] - Manager assembly from configuration
//! - [`maintenance`] - Node maintenance reconciler and admission route
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod leader_election;
pub mod lease;
pub mod maintenance;
pub mod manager;
pub mod metrics;
pub mod platform;
pub mod runnable;
pub mod setup;
pub mod signal;
pub mod telemetry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
