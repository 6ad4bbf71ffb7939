use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::{signal, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::core::connection::ConnectionManager;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why the process is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from code
    Requested,
}

/// Coordinates process shutdown: OS signals in, one cancellation token out,
/// then a bounded wait for connections to drain.
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            drain_timeout,
        }
    }

    /// Token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start shutdown. Only the first call has an effect; returns whether it was this one.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            tracing::warn!(?reason, "shutdown already initiated, ignoring");
            return false;
        }
        *current = Some(reason);
        self.token.cancel();
        tracing::info!(?reason, "shutdown initiated");
        true
    }

    /// Wait for SIGINT or SIGTERM (or an earlier [`trigger`](Self::trigger)).
    pub async fn run_signal_handler(&self) -> Result<ShutdownReason> {
        tracing::info!("signal handler started, listening for SIGINT and SIGTERM");

        let reason = tokio::select! {
            _ = self.token.cancelled() => {
                return Ok(self.reason().unwrap_or(ShutdownReason::Requested));
            }
            res = signal::ctrl_c() => {
                res.wrap_err("Failed to listen for Ctrl+C")?;
                ShutdownReason::Interrupt
            }
            res = wait_for_sigterm() => {
                res?;
                ShutdownReason::Terminate
            }
        };
        self.trigger(reason);
        Ok(reason)
    }

    /// Wait for open connections to finish, up to the drain timeout, then
    /// close whatever is left. Returns the number closed by force.
    pub async fn drain(&self, connections: &ConnectionManager) -> usize {
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            let remaining = connections.active_connection_count();
            if remaining == 0 {
                tracing::info!("all connections drained");
                return 0;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    remaining,
                    timeout = ?self.drain_timeout,
                    "drain timeout exceeded, closing remaining connections"
                );
                return connections.close_all();
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Arc,
    };

    use super::*;
    use crate::{
        config::{BackendConfig, EndpointConfig, RateLimitConfig, RouteConfig},
        core::{
            backend::Backend, connection::ConnectionLease, rate_limit_manager::RateLimitManager,
            route::Route,
        },
    };

    fn manager_with_connection() -> (ConnectionManager, ConnectionLease) {
        let manager = ConnectionManager::new(Arc::new(RateLimitManager::new(
            RateLimitConfig::unlimited(),
        )));
        let backend = Arc::new(
            Backend::from_config(&BackendConfig::new(
                "api",
                vec![EndpointConfig::new("10.0.0.1", 1)],
            ))
            .unwrap(),
        );
        let route =
            Arc::new(Route::from_config(&RouteConfig::new("api.example.com", "api")).unwrap());
        let endpoint = backend.endpoints()[0].clone();
        let lease = manager
            .add_connection(
                route,
                backend,
                endpoint,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
            )
            .unwrap();
        (manager, lease)
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();
        assert!(!shutdown.is_shutdown_initiated());

        assert!(shutdown.trigger(ShutdownReason::Requested));
        assert!(!shutdown.trigger(ShutdownReason::Terminate));
        assert!(token.is_cancelled());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
    }

    #[tokio::test]
    async fn test_signal_handler_returns_after_trigger() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger(ShutdownReason::Requested);
        let reason = shutdown.run_signal_handler().await.unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_forces_close_after_timeout() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(5));
        let (manager, lease) = manager_with_connection();

        let forced = shutdown.drain(&manager).await;
        assert_eq!(forced, 1);
        assert_eq!(manager.active_connection_count(), 0);
        drop(lease);
    }

    #[tokio::test]
    async fn test_drain_returns_once_empty() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(5));
        let (manager, lease) = manager_with_connection();
        drop(lease);
        assert_eq!(shutdown.drain(&manager).await, 0);
    }
}
