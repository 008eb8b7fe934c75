//! Graceful shutdown handling for the broadcast engine.
//!
//! Coordinated shutdown:
//! 1. Queue a closure notice to every connection
//! 2. Signal background tasks to stop
//! 3. Wait a bounded drain window for connections to close
//! 4. Force-close whatever remains

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::timeout;

use crate::connection_manager::ConnectionManager;
use crate::error::CloseReason;
use crate::websocket::ServerFrame;

/// Timeout for queueing the notice to a single connection
const NOTICE_SEND_TIMEOUT_SECS: u64 = 2;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for clients to be notified (default: 5 seconds)
    pub client_notification_timeout: Duration,
    /// Time to wait for connections to close on their own (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Suggested reconnect delay sent to clients (default: 5 seconds)
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            reconnect_after_seconds: 5,
        }
    }
}

/// Handles graceful shutdown of the engine
pub struct GracefulShutdown {
    manager: Arc<ConnectionManager>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    /// Create a shutdown handler; the drain window comes from the
    /// engine configuration.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let config = ShutdownConfig {
            drain_timeout: Duration::from_secs(manager.config().drain_timeout_secs),
            ..Default::default()
        };
        Self { manager, config }
    }

    pub fn with_config(manager: Arc<ConnectionManager>, config: ShutdownConfig) -> Self {
        Self { manager, config }
    }

    /// Execute the shutdown sequence.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self, notice),
        fields(total_connections = self.manager.stats().total_connections)
    )]
    pub async fn execute(&self, notice: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let initial = self.manager.stats().total_connections;

        tracing::info!(notice = %notice, "Starting graceful shutdown - Phase 1: Notifying clients");
        let notified = self.notify_clients(notice).await;

        tracing::info!("Phase 2: Signaling background tasks to stop");
        self.manager.signal_shutdown();

        tracing::info!("Phase 3: Waiting for connections to drain");
        let closed_gracefully = self.wait_for_connections_to_close(initial).await;

        tracing::info!("Phase 4: Force-closing remaining connections");
        let forced = self.force_close_remaining().await;

        let result = ShutdownResult {
            notified,
            closed_gracefully,
            forced,
            duration: start.elapsed(),
        };

        tracing::info!(
            notified = result.notified,
            closed_gracefully = result.closed_gracefully,
            forced = result.forced,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    /// Queue the shutdown notice to every connection in parallel.
    async fn notify_clients(&self, notice: &str) -> usize {
        let connections = self.manager.handles();
        let total = connections.len();

        if total == 0 {
            return 0;
        }

        tracing::info!(total_connections = total, "Sending shutdown notices");

        let frame = ServerFrame::shutdown(notice, self.config.reconnect_after_seconds);
        let mut futures = FuturesUnordered::new();
        let mut notified = 0;

        for conn in connections {
            let frame = frame.clone();
            futures.push(async move {
                let send_timeout = Duration::from_secs(NOTICE_SEND_TIMEOUT_SECS);
                match timeout(send_timeout, conn.deliver(frame)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::debug!(
                            connection_id = %conn.id,
                            error = %e,
                            "Failed to queue shutdown notice"
                        );
                        false
                    }
                    Err(_) => {
                        tracing::debug!(
                            connection_id = %conn.id,
                            "Timeout queueing shutdown notice"
                        );
                        false
                    }
                }
            });
        }

        let notify_future = async {
            while let Some(success) = futures.next().await {
                if success {
                    notified += 1;
                }
            }
        };

        let _ = timeout(self.config.client_notification_timeout, notify_future).await;

        tracing::info!(notified = notified, total = total, "Shutdown notices sent");
        notified
    }

    /// Wait for connections to close on their own within the drain window.
    async fn wait_for_connections_to_close(&self, initial: usize) -> usize {
        if initial == 0 {
            return 0;
        }

        let manager = self.manager.clone();
        let wait_future = async {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if manager.stats().total_connections == 0 {
                    break;
                }
            }
        };

        let _ = timeout(self.config.drain_timeout, wait_future).await;

        let remaining = self.manager.stats().total_connections;
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Drain window elapsed with connections still open"
            );
        }

        initial - remaining
    }

    /// Force-close every connection still registered.
    async fn force_close_remaining(&self) -> usize {
        let ids = self.manager.connection_ids();
        let mut forced = 0;

        for id in ids {
            if self.manager.remove(id, CloseReason::ServerShutdown).await {
                forced += 1;
            }
        }

        forced
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Connections that received the shutdown notice
    pub notified: usize,
    /// Connections that closed on their own within the drain window
    pub closed_gracefully: usize,
    /// Connections force-closed after the drain window
    pub forced: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
