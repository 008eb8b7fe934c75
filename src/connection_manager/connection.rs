//! Per-connection state machine and bounded outbound queue.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{CloseReason, EngineError, Result};
use crate::ratelimit::{RateLimitDecision, SlidingWindow};
use crate::websocket::ServerFrame;

pub type ConnectionId = Uuid;

/// Connection lifecycle. Transitions are strictly monotonic:
/// `Connecting -> Connected -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Context produced by the handshake/auth collaborator.
///
/// Credentials are verified upstream; the engine trusts the identity
/// and never re-verifies it.
#[derive(Debug, Clone, Default)]
pub struct HandshakeContext {
    pub identity: Option<String>,
    pub origin: Option<IpAddr>,
    pub protocol_headers: HashMap<String, String>,
}

impl HandshakeContext {
    pub fn new(identity: Option<String>, origin: IpAddr) -> Self {
        Self {
            identity,
            origin: Some(origin),
            protocol_headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.protocol_headers.insert(name.into(), value.into());
        self
    }
}

/// Handle for a single admitted connection.
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Option<String>,
    pub origin: Option<IpAddr>,
    pub admitted_at: DateTime<Utc>,
    /// Free-form attributes set by downstream handlers
    pub metadata: DashMap<String, serde_json::Value>,
    state: AtomicU8,
    /// Last application activity (Unix milliseconds), monotone non-decreasing
    last_activity: AtomicI64,
    /// Last heartbeat acknowledgment (Unix milliseconds)
    last_heartbeat_ack: AtomicI64,
    sender: mpsc::Sender<ServerFrame>,
    rate_window: SlidingWindow,
    rooms: Mutex<HashSet<String>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(
        ctx: &HandshakeContext,
        sender: mpsc::Sender<ServerFrame>,
        config: &EngineConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identity: ctx.identity.clone(),
            origin: ctx.origin,
            admitted_at: now,
            metadata: DashMap::new(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_activity: AtomicI64::new(now.timestamp_millis()),
            last_heartbeat_ack: AtomicI64::new(now.timestamp_millis()),
            sender,
            rate_window: SlidingWindow::new(
                config.rate_limit_max_messages,
                Duration::from_secs(config.rate_limit_window_secs),
            ),
            rooms: Mutex::new(HashSet::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Advance the state machine. Returns false when the connection is
    /// already at or past `target`; transitions never move backwards.
    pub(crate) fn transition_to(&self, target: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= target as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Record application activity (any send or receive).
    pub fn touch(&self) {
        self.last_activity
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    /// Time since the last application activity.
    pub fn idle_for(&self) -> Duration {
        let elapsed_ms =
            (Utc::now().timestamp_millis() - self.last_activity.load(Ordering::Relaxed)).max(0);
        Duration::from_millis(elapsed_ms as u64)
    }

    /// Record a liveness probe acknowledgment. Probe traffic does not
    /// count as application activity, so acks keep idle detection intact.
    pub fn record_heartbeat_ack(&self) {
        self.last_heartbeat_ack
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since the last heartbeat acknowledgment.
    pub fn heartbeat_ack_age(&self) -> Duration {
        let elapsed_ms = (Utc::now().timestamp_millis()
            - self.last_heartbeat_ack.load(Ordering::Relaxed))
        .max(0);
        Duration::from_millis(elapsed_ms as u64)
    }

    /// Non-blocking insert into the bounded outbound queue.
    ///
    /// A full queue returns `Backpressure` immediately without growing
    /// the queue; the caller decides whether to retry or drop.
    pub fn enqueue(&self, frame: ServerFrame) -> Result<()> {
        self.enqueue_untracked(frame)?;
        self.touch();
        Ok(())
    }

    /// Enqueue without recording application activity. Used for liveness
    /// probes and shutdown notices, which must not reset idle detection.
    pub(crate) fn enqueue_untracked(&self, frame: ServerFrame) -> Result<()> {
        if self.state() >= ConnectionState::Closing {
            return Err(EngineError::ConnectionClosed);
        }

        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => EngineError::ConnectionClosed,
        })
    }

    /// Queue a frame, waiting for space. Only used by the shutdown path,
    /// where the caller bounds the wait with a timeout.
    pub(crate) async fn deliver(&self, frame: ServerFrame) -> Result<()> {
        if self.state() >= ConnectionState::Closing {
            return Err(EngineError::ConnectionClosed);
        }

        self.sender
            .send(frame)
            .await
            .map_err(|_| EngineError::ConnectionClosed)
    }

    /// Idempotent close: `Closing`, best-effort closure notice, `Closed`.
    ///
    /// Returns true for the single call that performed the transition;
    /// repeat calls are no-ops. Queued frames ahead of the notice are
    /// flushed by the transport drain loop within its shutdown window.
    pub fn close(&self, reason: CloseReason) -> bool {
        if !self.transition_to(ConnectionState::Closing) {
            return false;
        }

        // try_send directly: enqueue_untracked refuses Closing connections
        if self.sender.try_send(ServerFrame::close(reason)).is_err() {
            tracing::debug!(
                connection_id = %self.id,
                reason = %reason,
                "Closure notice dropped, outbound queue unavailable"
            );
        }

        self.transition_to(ConnectionState::Closed);
        true
    }

    /// Check the inbound rate limit window for one message.
    pub fn check_rate(&self) -> RateLimitDecision {
        self.rate_window.check()
    }

    /// Rooms this connection is currently a member of.
    pub fn rooms(&self) -> Vec<String> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.iter().cloned().collect()
    }

    pub(crate) fn add_room(&self, room: &str) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.insert(room.to_string());
    }

    pub(crate) fn remove_room(&self, room: &str) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.remove(room);
    }

    pub(crate) fn set_monitor(&self, handle: JoinHandle<()>) {
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        *monitor = Some(handle);
    }

    pub(crate) fn abort_monitor(&self) {
        let handle = {
            let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            monitor.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort_monitor();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}
