//! Signal handling for long-running operator commands.
//!
//! Backup, restore and migration are synchronous and have no cancellation
//! points. They run on a blocking worker; a SIGINT or SIGTERM received
//! meanwhile is reported and the coordinator keeps waiting, because
//! progress up to the last atomic write persists either way and abandoning
//! the worker would only hide where it stopped.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Cancelled once a shutdown signal has been received.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM and return its name.
    pub async fn wait_for_signal(&self) -> &'static str {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let name = tokio::select! {
            _ = ctrl_c => "SIGINT",
            _ = terminate => "SIGTERM",
        };
        self.token.cancel();
        name
    }

    /// Run `operation` on a blocking worker and wait for it to finish,
    /// reporting any shutdown signal received in the meantime.
    pub async fn run_blocking<T, F>(&self, label: &str, operation: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut handle = tokio::task::spawn_blocking(operation);

        tokio::select! {
            joined = &mut handle => return Ok(joined?),
            name = self.wait_for_signal() => {
                warn!(
                    "Received {}; '{}' cannot be interrupted mid-step, waiting for it to finish",
                    name, label
                );
            }
        }

        let value = handle.await?;
        info!("'{}' finished after shutdown request", label);
        Ok(value)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let coordinator = ShutdownCoordinator::new();
        let value = coordinator
            .run_blocking("sum", || (1..=10).sum::<u32>())
            .await
            .unwrap();
        assert_eq!(value, 55);
        assert!(!coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_worker_panic_is_an_error() {
        let coordinator = ShutdownCoordinator::new();
        let result = coordinator
            .run_blocking("boom", || -> u32 { panic!("worker failed") })
            .await;
        assert!(result.is_err());
    }
}
