//! Termination signal handling

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Error, Result};

/// Root token cancelled on the first SIGTERM or SIGINT
///
/// Handlers are installed before this returns; failure to install them is a
/// setup error. A second signal exits the process immediately with status 1.
pub fn shutdown_token() -> Result<CancellationToken> {
    let mut signals =
        Signals::install().map_err(|e| Error::setup("signal", format!("install handlers: {}", e)))?;

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        signals.recv().await;
        info!("Termination signal received, shutting down");
        cancel.cancel();

        signals.recv().await;
        warn!("Second termination signal received, exiting");
        std::process::exit(1);
    });

    Ok(token)
}

#[cfg(unix)]
struct Signals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.terminate.recv() => {}
            _ = self.interrupt.recv() => {}
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to wait for ctrl-c");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handlers_install_and_token_starts_live() {
        let token = shutdown_token().unwrap();
        assert!(!token.is_cancelled());

        // installing twice in one process is allowed
        let second = shutdown_token().unwrap();
        assert!(!second.is_cancelled());
    }
}
