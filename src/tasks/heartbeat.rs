//! Per-connection liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::connection_manager::{Connection, ConnectionManager};
use crate::error::{CloseReason, EngineError};
use crate::metrics::{HEARTBEAT_TIMEOUTS_TOTAL, IDLE_TIMEOUTS_TOTAL};
use crate::websocket::ServerFrame;

/// Timing knobs for one monitor, split out so tests can run with
/// millisecond budgets.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    pub probe_interval: Duration,
    pub ack_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&EngineConfig> for HeartbeatSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            probe_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            ack_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

/// Background loop probing one connection for liveness.
///
/// Sends a ping frame every probe interval and force-closes the
/// connection when acknowledgments stop arriving. An independent idle
/// check closes connections that stay technically alive but carry no
/// application traffic. The registry cancels the monitor as part of
/// connection teardown.
pub struct HeartbeatMonitor {
    manager: Arc<ConnectionManager>,
    connection: Arc<Connection>,
    settings: HeartbeatSettings,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatMonitor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        connection: Arc<Connection>,
        config: &EngineConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self::with_settings(manager, connection, HeartbeatSettings::from(config), shutdown)
    }

    pub fn with_settings(
        manager: Arc<ConnectionManager>,
        connection: Arc<Connection>,
        settings: HeartbeatSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            manager,
            connection,
            settings,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut probe_timer = tokio::time::interval(self.settings.probe_interval);
        // Skip immediate first tick
        probe_timer.tick().await;

        tracing::debug!(
            connection_id = %self.connection.id,
            probe_interval_ms = self.settings.probe_interval.as_millis() as u64,
            ack_timeout_ms = self.settings.ack_timeout.as_millis() as u64,
            idle_timeout_ms = self.settings.idle_timeout.as_millis() as u64,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(
                        connection_id = %self.connection.id,
                        "Heartbeat monitor received shutdown signal"
                    );
                    break;
                }
                _ = probe_timer.tick() => {
                    if !self.connection.is_open() {
                        break;
                    }

                    if self.connection.heartbeat_ack_age() > self.settings.ack_timeout {
                        HEARTBEAT_TIMEOUTS_TOTAL.inc();
                        tracing::warn!(
                            connection_id = %self.connection.id,
                            ack_age_ms = self.connection.heartbeat_ack_age().as_millis() as u64,
                            "No heartbeat acknowledgment, force-closing"
                        );
                        self.force_close(CloseReason::HeartbeatTimeout);
                        break;
                    }

                    if self.connection.idle_for() > self.settings.idle_timeout {
                        IDLE_TIMEOUTS_TOTAL.inc();
                        tracing::info!(
                            connection_id = %self.connection.id,
                            idle_ms = self.connection.idle_for().as_millis() as u64,
                            "Connection idle, force-closing"
                        );
                        self.force_close(CloseReason::IdleTimeout);
                        break;
                    }

                    match self.connection.enqueue_untracked(ServerFrame::Ping) {
                        Ok(()) => {}
                        Err(EngineError::Backpressure) => {
                            // A saturated queue drops the probe; the ack
                            // timeout decides the connection's fate
                            tracing::debug!(
                                connection_id = %self.connection.id,
                                "Heartbeat probe dropped, outbound queue full"
                            );
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        tracing::debug!(connection_id = %self.connection.id, "Heartbeat monitor stopped");
    }

    /// Removal runs on a detached task: teardown aborts this monitor,
    /// and aborting the task that is itself mid-removal would lose the
    /// disconnect notification.
    fn force_close(&self, reason: CloseReason) {
        let manager = Arc::clone(&self.manager);
        let id = self.connection.id;
        tokio::spawn(async move {
            manager.remove(id, reason).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::connection_manager::{ConnectionState, HandshakeContext};
    use crate::error::CloseReason;

    fn ctx(identity: &str) -> HandshakeContext {
        HandshakeContext::new(Some(identity.to_string()), "127.0.0.1".parse().unwrap())
    }

    fn fast_settings() -> HeartbeatSettings {
        HeartbeatSettings {
            probe_interval: Duration::from_millis(10),
            ack_timeout: Duration::from_millis(60),
            idle_timeout: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown_signal() {
        let manager = Arc::new(ConnectionManager::new(EngineConfig::default()));
        let admission = manager.admit(ctx("user-1")).await.unwrap();

        let monitor = HeartbeatMonitor::with_settings(
            manager.clone(),
            admission.connection.clone(),
            fast_settings(),
            manager.subscribe_shutdown(),
        );
        let handle = tokio::spawn(monitor.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.signal_shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor should stop")
            .expect("monitor should not panic");
    }

    #[tokio::test]
    async fn test_missing_acks_force_close_with_heartbeat_timeout() {
        let manager = Arc::new(ConnectionManager::new(EngineConfig::default()));
        let mut admission = manager.admit(ctx("user-1")).await.unwrap();
        let id = admission.connection.id;

        let monitor = HeartbeatMonitor::with_settings(
            manager.clone(),
            admission.connection.clone(),
            fast_settings(),
            manager.subscribe_shutdown(),
        );
        tokio::spawn(monitor.run());

        // ack_timeout is 60ms and nothing acks; the next check cycle
        // after expiry must close the connection
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!manager.contains(id));
        assert_eq!(admission.connection.state(), ConnectionState::Closed);

        let mut saw_ping = false;
        let mut close_reason = None;
        while let Ok(frame) = admission.outbound.try_recv() {
            match frame {
                ServerFrame::Ping => saw_ping = true,
                ServerFrame::Close { reason } => close_reason = Some(reason),
                _ => {}
            }
        }
        assert!(saw_ping, "monitor should have sent probes");
        assert_eq!(close_reason, Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn test_acknowledged_connection_stays_open() {
        let manager = Arc::new(ConnectionManager::new(EngineConfig::default()));
        let admission = manager.admit(ctx("user-1")).await.unwrap();
        let id = admission.connection.id;

        let monitor = HeartbeatMonitor::with_settings(
            manager.clone(),
            admission.connection.clone(),
            fast_settings(),
            manager.subscribe_shutdown(),
        );
        tokio::spawn(monitor.run());

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            admission.connection.record_heartbeat_ack();
        }

        assert!(manager.contains(id));
        assert!(admission.connection.is_open());
    }

    #[tokio::test]
    async fn test_idle_connection_closed_despite_fresh_acks() {
        let manager = Arc::new(ConnectionManager::new(EngineConfig::default()));
        let mut admission = manager.admit(ctx("user-1")).await.unwrap();
        let id = admission.connection.id;

        let settings = HeartbeatSettings {
            probe_interval: Duration::from_millis(10),
            ack_timeout: Duration::from_secs(3600),
            idle_timeout: Duration::from_millis(40),
        };
        let monitor = HeartbeatMonitor::with_settings(
            manager.clone(),
            admission.connection.clone(),
            settings,
            manager.subscribe_shutdown(),
        );
        tokio::spawn(monitor.run());

        // Keep liveness acks fresh without any application traffic
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            admission.connection.record_heartbeat_ack();
        }

        assert!(!manager.contains(id));

        let mut close_reason = None;
        while let Ok(frame) = admission.outbound.try_recv() {
            if let ServerFrame::Close { reason } = frame {
                close_reason = Some(reason);
            }
        }
        assert_eq!(close_reason, Some(CloseReason::IdleTimeout));
    }
}
