use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};

use crate::config::{EmptyRoomPolicy, EngineConfig};
use crate::error::{CapacityScope, CloseReason, EngineError, Result};
use crate::message::Message;
use crate::metrics::{
    BROADCAST_LATENCY, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_OPENED_TOTAL,
    ERRORS_TOTAL, MESSAGES_SENT_TOTAL, ROOMS_ACTIVE,
};
use crate::middleware::MiddlewareChain;
use crate::tasks::HeartbeatMonitor;
use crate::websocket::ServerFrame;

use super::connection::{Connection, ConnectionId, ConnectionState, HandshakeContext};
use super::room::{is_valid_room_id, Room, RoomOptions};
use super::stats::{ConnectionSnapshot, EngineStats, RoomSnapshot};

/// Upper bound on concurrent enqueue futures per fan-out batch
const MAX_CONCURRENT_ENQUEUES: usize = 1000;

/// A successfully admitted connection: the shared handle plus the
/// outbound end the transport drains to the peer.
#[derive(Debug)]
pub struct Admission {
    pub connection: Arc<Connection>,
    pub outbound: mpsc::Receiver<ServerFrame>,
}

/// One member that could not be enqueued during a broadcast.
#[derive(Debug)]
pub struct BroadcastFailure {
    pub connection_id: ConnectionId,
    pub error: EngineError,
}

/// Outcome of a broadcast fan-out.
#[derive(Debug)]
pub struct BroadcastResult {
    pub room: String,
    /// Members in the snapshot taken at call time
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<BroadcastFailure>,
    pub elapsed: Duration,
}

/// Index tables guarded by the registry lock.
///
/// The lock covers index mutation only and is never held across a
/// suspension point; fan-out happens on snapshots taken under a read
/// guard, so large broadcasts never block admission.
struct RegistryIndex {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    rooms: HashMap<String, Room>,
    identities: HashMap<String, HashSet<ConnectionId>>,
    origins: HashMap<IpAddr, HashSet<ConnectionId>>,
}

impl RegistryIndex {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            rooms: HashMap::new(),
            identities: HashMap::new(),
            origins: HashMap::new(),
        }
    }

    fn active_rooms(&self) -> usize {
        self.rooms.values().filter(|r| !r.members.is_empty()).count()
    }
}

/// The single authoritative registry of connections and rooms.
///
/// Construct one instance per server process and inject it into every
/// dependent component; there is no ambient singleton.
pub struct ConnectionManager {
    config: EngineConfig,
    middleware: MiddlewareChain,
    index: RwLock<RegistryIndex>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_middleware(config, MiddlewareChain::new())
    }

    pub fn with_middleware(config: EngineConfig, middleware: MiddlewareChain) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            middleware,
            index: RwLock::new(RegistryIndex::new()),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receiver for the engine-wide shutdown signal; per-connection
    /// monitor tasks subscribe at spawn time.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal all background tasks to stop.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Admit an authenticated channel into the registry.
    ///
    /// Ceilings (global, per-identity, per-origin) are checked before a
    /// connection object exists; on success the connection is registered,
    /// moved to `Connected`, its liveness monitor is started and the
    /// middleware chain runs `on_connect`. Any interceptor rejection
    /// aborts the admission. The admitted connection is immediately
    /// visible to every registry query.
    pub async fn admit(self: &Arc<Self>, ctx: HandshakeContext) -> Result<Admission> {
        if let Err(e) = self.check_allowed_origin(&ctx) {
            self.report_failure(None, &e).await;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel::<ServerFrame>(self.config.outbound_queue_depth);

        let connection = match self.register(&ctx, tx) {
            Ok(connection) => connection,
            Err(e) => {
                self.report_failure(None, &e).await;
                return Err(e);
            }
        };

        connection.transition_to(ConnectionState::Connected);

        let monitor = HeartbeatMonitor::new(
            Arc::clone(self),
            connection.clone(),
            &self.config,
            self.subscribe_shutdown(),
        );
        connection.set_monitor(tokio::spawn(monitor.run()));

        if let Err(e) = self.middleware.on_connect(&connection).await {
            // Rejection aborts the admission: tear down without firing
            // on_disconnect (the connection never finished admission)
            self.deregister(connection.id);
            connection.abort_monitor();
            connection.close(CloseReason::AdmissionRejected);
            self.report_failure(Some(&connection), &e).await;
            return Err(e);
        }

        CONNECTIONS_OPENED_TOTAL.inc();
        tracing::info!(
            connection_id = %connection.id,
            identity = connection.identity.as_deref().unwrap_or("-"),
            origin = ?connection.origin,
            "Connection registered"
        );

        Ok(Admission {
            connection,
            outbound: rx,
        })
    }

    /// Ceiling checks and index insertion under the registry lock.
    ///
    /// Ceilings fail before any connection object exists; the lock is
    /// held for index mutation only.
    fn register(
        &self,
        ctx: &HandshakeContext,
        tx: mpsc::Sender<ServerFrame>,
    ) -> Result<Arc<Connection>> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());

        if index.connections.len() >= self.config.max_connections {
            return Err(EngineError::CapacityExceeded {
                scope: CapacityScope::Global,
                current: index.connections.len(),
                max: self.config.max_connections,
            });
        }

        if let Some(identity) = &ctx.identity {
            let current = index.identities.get(identity).map_or(0, HashSet::len);
            if current >= self.config.max_connections_per_identity {
                return Err(EngineError::CapacityExceeded {
                    scope: CapacityScope::Identity,
                    current,
                    max: self.config.max_connections_per_identity,
                });
            }
        }

        if let Some(origin) = ctx.origin {
            let current = index.origins.get(&origin).map_or(0, HashSet::len);
            if current >= self.config.max_connections_per_origin {
                return Err(EngineError::CapacityExceeded {
                    scope: CapacityScope::Origin,
                    current,
                    max: self.config.max_connections_per_origin,
                });
            }
        }

        let connection = Arc::new(Connection::new(ctx, tx, &self.config));
        index.connections.insert(connection.id, connection.clone());
        if let Some(identity) = &connection.identity {
            index
                .identities
                .entry(identity.clone())
                .or_default()
                .insert(connection.id);
        }
        if let Some(origin) = connection.origin {
            index.origins.entry(origin).or_default().insert(connection.id);
        }
        CONNECTIONS_ACTIVE.set(index.connections.len() as i64);

        Ok(connection)
    }

    fn check_allowed_origin(&self, ctx: &HandshakeContext) -> Result<()> {
        if self.config.allowed_origins.is_empty() {
            return Ok(());
        }

        let origin = ctx
            .protocol_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("origin"))
            .map(|(_, value)| value.as_str());

        match origin {
            Some(origin) if self.config.allowed_origins.iter().any(|o| o == origin) => Ok(()),
            Some(origin) => Err(EngineError::AdmissionDenied(format!(
                "origin {} is not allowed",
                origin
            ))),
            None => Err(EngineError::AdmissionDenied(
                "missing origin header".to_string(),
            )),
        }
    }

    async fn report_failure(&self, connection: Option<&Arc<Connection>>, error: &EngineError) {
        tracing::warn!(
            connection_id = connection.map(|c| c.id.to_string()).as_deref().unwrap_or("-"),
            kind = error.kind(),
            error = %error,
            "Admission failed"
        );
        self.middleware.on_error(connection, error).await;
    }

    /// Remove a connection from the id index, every room and the
    /// per-identity/per-origin tables. Returns the handle for teardown;
    /// only the first call for a given id gets it.
    fn deregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());

        let connection = index.connections.remove(&id)?;

        if let Some(identity) = &connection.identity {
            if let Some(members) = index.identities.get_mut(identity) {
                members.remove(&id);
                if members.is_empty() {
                    index.identities.remove(identity);
                }
            }
        }

        if let Some(origin) = connection.origin {
            if let Some(members) = index.origins.get_mut(&origin) {
                members.remove(&id);
                if members.is_empty() {
                    index.origins.remove(&origin);
                }
            }
        }

        for room_id in connection.rooms() {
            if let Some(room) = index.rooms.get_mut(&room_id) {
                room.members.remove(&id);
                if room.members.is_empty() && self.config.empty_room_policy == EmptyRoomPolicy::Delete
                {
                    index.rooms.remove(&room_id);
                }
            }
            connection.remove_room(&room_id);
        }

        CONNECTIONS_ACTIVE.set(index.connections.len() as i64);
        ROOMS_ACTIVE.set(index.active_rooms() as i64);

        Some(connection)
    }

    /// Remove a connection and tear it down.
    ///
    /// Idempotent: repeated calls are no-ops and `on_disconnect` fires
    /// exactly once regardless of call count.
    pub async fn remove(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let Some(connection) = self.deregister(id) else {
            return false;
        };

        connection.abort_monitor();
        connection.close(reason);
        CONNECTIONS_CLOSED_TOTAL.inc();

        self.middleware.on_disconnect(&connection, reason).await;

        tracing::info!(
            connection_id = %id,
            identity = connection.identity.as_deref().unwrap_or("-"),
            reason = %reason,
            "Connection unregistered"
        );

        true
    }

    /// Add a connection to a room, creating the room lazily.
    pub fn join_room(&self, id: ConnectionId, room_id: &str, options: RoomOptions) -> Result<()> {
        if !is_valid_room_id(room_id) {
            return Err(EngineError::ValidationFailed(format!(
                "invalid room id: {:?}",
                room_id
            )));
        }

        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());

        let connection = index
            .connections
            .get(&id)
            .ok_or(EngineError::ConnectionClosed)?
            .clone();
        if !connection.is_open() {
            return Err(EngineError::ConnectionClosed);
        }

        let room = index
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id, options));

        if room.members.contains(&id) {
            return Ok(());
        }
        if room.is_full() {
            return Err(EngineError::RoomFull {
                room: room_id.to_string(),
                capacity: room.capacity.unwrap_or(0),
            });
        }

        room.members.insert(id);
        connection.add_room(room_id);
        ROOMS_ACTIVE.set(index.active_rooms() as i64);

        tracing::debug!(connection_id = %id, room = %room_id, "Joined room");
        Ok(())
    }

    /// Remove a connection from a room. Leaving an unknown room is a
    /// no-op.
    pub fn leave_room(&self, id: ConnectionId, room_id: &str) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());

        let connection = index
            .connections
            .get(&id)
            .ok_or(EngineError::ConnectionClosed)?
            .clone();
        if !connection.is_open() {
            return Err(EngineError::ConnectionClosed);
        }

        let Some(room) = index.rooms.get_mut(room_id) else {
            return Ok(());
        };
        if !room.members.remove(&id) {
            return Ok(());
        }

        if room.members.is_empty() && self.config.empty_room_policy == EmptyRoomPolicy::Delete {
            index.rooms.remove(room_id);
        }

        connection.remove_room(room_id);
        ROOMS_ACTIVE.set(index.active_rooms() as i64);

        tracing::debug!(connection_id = %id, room = %room_id, "Left room");
        Ok(())
    }

    /// Fan a message out to every room member.
    ///
    /// Membership is snapshotted at call time; late joiners and leavers
    /// are unaffected by an in-flight broadcast. Per-member failures
    /// (full queue, closing connection) are collected without aborting
    /// the remaining deliveries.
    pub async fn broadcast(
        &self,
        room_id: &str,
        mut message: Message,
        exclude: Option<ConnectionId>,
    ) -> Result<BroadcastResult> {
        message.validate(self.config.max_message_bytes)?;
        if message.room_id.is_none() {
            message.room_id = Some(room_id.to_string());
        }

        // Snapshot membership under the read guard, fan out after
        let members: Vec<Arc<Connection>> = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            let room = index
                .rooms
                .get(room_id)
                .ok_or_else(|| EngineError::RoomNotFound(room_id.to_string()))?;

            room.members
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| index.connections.get(id).cloned())
                .collect()
        };

        let attempted = members.len();
        let budget = Duration::from_millis(self.config.broadcast_timeout_ms);
        let start = Instant::now();
        let frame = ServerFrame::message(message);

        let mut delivered = 0usize;
        let mut failures = Vec::new();

        for batch in members.chunks(MAX_CONCURRENT_ENQUEUES) {
            if start.elapsed() >= budget {
                // Fan-out budget exhausted; remaining members count as
                // failed attempts rather than silently skipped ones
                for connection in batch {
                    failures.push(BroadcastFailure {
                        connection_id: connection.id,
                        error: EngineError::Internal("broadcast budget exhausted".to_string()),
                    });
                }
                continue;
            }

            let enqueues: Vec<_> = batch
                .iter()
                .map(|connection| {
                    let connection = Arc::clone(connection);
                    let frame = frame.clone();
                    async move {
                        connection.enqueue(frame).map_err(|error| BroadcastFailure {
                            connection_id: connection.id,
                            error,
                        })
                    }
                })
                .collect();

            for result in join_all(enqueues).await {
                match result {
                    Ok(()) => delivered += 1,
                    Err(failure) => failures.push(failure),
                }
            }
        }

        let elapsed = start.elapsed();
        MESSAGES_SENT_TOTAL
            .with_label_values(&[room_id])
            .inc_by(delivered as u64);
        BROADCAST_LATENCY
            .with_label_values(&[room_id])
            .observe(elapsed.as_secs_f64());
        for failure in &failures {
            ERRORS_TOTAL.with_label_values(&[failure.error.kind()]).inc();
            tracing::debug!(
                connection_id = %failure.connection_id,
                room = %room_id,
                error = %failure.error,
                "Broadcast delivery failed"
            );
        }

        tracing::debug!(
            room = %room_id,
            attempted = attempted,
            delivered = delivered,
            failed = failures.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "Broadcast completed"
        );

        Ok(BroadcastResult {
            room: room_id.to_string(),
            attempted,
            delivered,
            failures,
            elapsed,
        })
    }

    /// Run the middleware `on_message` lifecycle point for a validated
    /// inbound message. A rejection fails the dispatch with the
    /// interceptor's stated reason.
    pub async fn accept_message(
        &self,
        connection: &Arc<Connection>,
        message: &Message,
    ) -> Result<()> {
        self.middleware.on_message(connection, message).await
    }

    /// Notify the middleware chain of a failure. Every failure passes
    /// through here or the admission path; none are silently swallowed.
    pub async fn report_error(&self, connection: Option<&Arc<Connection>>, error: &EngineError) {
        self.middleware.on_error(connection, error).await;
    }

    /// Look up a live connection handle for direct enqueue operations.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.connections.get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.connections.contains_key(&id)
    }

    /// Read-only snapshot of one connection.
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionSnapshot> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.connections.get(&id).map(|c| ConnectionSnapshot {
            id: c.id,
            identity: c.identity.clone(),
            origin: c.origin,
            state: c.state().as_str().to_string(),
            admitted_at: c.admitted_at,
            last_activity: c.last_activity(),
            rooms: c.rooms(),
        })
    }

    /// Read-only snapshot of one room.
    pub fn room(&self, room_id: &str) -> Option<RoomSnapshot> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.rooms.get(room_id).map(|r| RoomSnapshot {
            id: r.id.clone(),
            members: r.members.iter().copied().collect(),
            capacity: r.capacity,
            private: r.private,
            created_at: r.created_at,
        })
    }

    pub fn room_members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.room(room_id).map(|r| r.members).unwrap_or_default()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.connections.keys().copied().collect()
    }

    /// All live handles; used by the shutdown path to notify peers.
    pub(crate) fn handles(&self) -> Vec<Arc<Connection>> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.connections.values().cloned().collect()
    }

    pub fn stats(&self) -> EngineStats {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let rooms = index
            .rooms
            .iter()
            .map(|(id, room)| (id.clone(), room.members.len()))
            .collect();

        EngineStats {
            total_connections: index.connections.len(),
            unique_identities: index.identities.len(),
            rooms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn test_manager(config: EngineConfig) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(config))
    }

    fn ctx(identity: &str) -> HandshakeContext {
        HandshakeContext::new(Some(identity.to_string()), "127.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn test_admitted_connection_is_immediately_visible() {
        let manager = test_manager(EngineConfig::default());
        let admission = manager.admit(ctx("user-1")).await.unwrap();
        let id = admission.connection.id;

        assert!(manager.contains(id));
        assert!(manager.get(id).is_some());
        let snapshot = manager.connection(id).unwrap();
        assert_eq!(snapshot.identity.as_deref(), Some("user-1"));
        assert_eq!(snapshot.state, "connected");
        assert_eq!(manager.stats().total_connections, 1);
    }

    #[tokio::test]
    async fn test_global_ceiling() {
        let config = EngineConfig {
            max_connections: 2,
            ..Default::default()
        };
        let manager = test_manager(config);

        let _a = manager.admit(ctx("u1")).await.unwrap();
        let _b = manager.admit(ctx("u2")).await.unwrap();

        let err = manager.admit(ctx("u3")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded {
                scope: CapacityScope::Global,
                ..
            }
        ));
        assert_eq!(manager.stats().total_connections, 2);
    }

    #[tokio::test]
    async fn test_per_identity_ceiling() {
        let config = EngineConfig {
            max_connections_per_identity: 1,
            ..Default::default()
        };
        let manager = test_manager(config);

        let _a = manager.admit(ctx("dup")).await.unwrap();
        let err = manager.admit(ctx("dup")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded {
                scope: CapacityScope::Identity,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_per_origin_ceiling() {
        let config = EngineConfig {
            max_connections_per_origin: 1,
            ..Default::default()
        };
        let manager = test_manager(config);

        let _a = manager.admit(ctx("u1")).await.unwrap();
        let err = manager.admit(ctx("u2")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded {
                scope: CapacityScope::Origin,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_origin_allowlist() {
        let config = EngineConfig {
            allowed_origins: vec!["https://app.example.com".to_string()],
            ..Default::default()
        };
        let manager = test_manager(config);

        let denied = manager
            .admit(ctx("u1").with_header("Origin", "https://evil.example.com"))
            .await;
        assert!(matches!(denied, Err(EngineError::AdmissionDenied(_))));

        let missing = manager.admit(ctx("u1")).await;
        assert!(matches!(missing, Err(EngineError::AdmissionDenied(_))));

        let allowed = manager
            .admit(ctx("u1").with_header("Origin", "https://app.example.com"))
            .await;
        assert!(allowed.is_ok());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let manager = test_manager(EngineConfig::default());
        let admission = manager.admit(ctx("user-1")).await.unwrap();
        let id = admission.connection.id;

        manager.join_room(id, "lobby", RoomOptions::default()).unwrap();

        assert!(manager.remove(id, CloseReason::Normal).await);
        assert!(!manager.remove(id, CloseReason::Normal).await);

        assert!(!manager.contains(id));
        assert!(manager.room_members("lobby").is_empty());
        assert_eq!(
            admission.connection.state(),
            ConnectionState::Closed
        );
    }

    #[tokio::test]
    async fn test_join_requires_connected_state() {
        let manager = test_manager(EngineConfig::default());
        let admission = manager.admit(ctx("user-1")).await.unwrap();
        let id = admission.connection.id;

        admission.connection.close(CloseReason::Normal);
        let err = manager
            .join_room(id, "lobby", RoomOptions::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_room_capacity_enforced() {
        let manager = test_manager(EngineConfig::default());
        let a = manager.admit(ctx("a")).await.unwrap();
        let b = manager.admit(ctx("b")).await.unwrap();
        let c = manager.admit(ctx("c")).await.unwrap();

        let duo = RoomOptions {
            capacity: Some(2),
            private: false,
        };
        manager.join_room(a.connection.id, "duo", duo).unwrap();
        manager.join_room(b.connection.id, "duo", duo).unwrap();

        let err = manager.join_room(c.connection.id, "duo", duo).unwrap_err();
        assert!(matches!(err, EngineError::RoomFull { capacity: 2, .. }));
        assert_eq!(manager.room_members("duo").len(), 2);
    }

    #[tokio::test]
    async fn test_leave_unknown_room_is_noop() {
        let manager = test_manager(EngineConfig::default());
        let admission = manager.admit(ctx("user-1")).await.unwrap();

        assert!(manager.leave_room(admission.connection.id, "nowhere").is_ok());
    }

    #[tokio::test]
    async fn test_empty_room_deleted_by_default() {
        let manager = test_manager(EngineConfig::default());
        let admission = manager.admit(ctx("user-1")).await.unwrap();
        let id = admission.connection.id;

        manager.join_room(id, "lobby", RoomOptions::default()).unwrap();
        assert!(manager.room("lobby").is_some());

        manager.leave_room(id, "lobby").unwrap();
        assert!(manager.room("lobby").is_none());
    }

    #[tokio::test]
    async fn test_empty_room_retained_under_retain_policy() {
        let config = EngineConfig {
            empty_room_policy: EmptyRoomPolicy::Retain,
            ..Default::default()
        };
        let manager = test_manager(config);
        let admission = manager.admit(ctx("user-1")).await.unwrap();
        let id = admission.connection.id;

        manager.join_room(id, "lobby", RoomOptions::default()).unwrap();
        manager.leave_room(id, "lobby").unwrap();

        let room = manager.room("lobby").expect("room should be retained");
        assert!(room.members.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let manager = test_manager(EngineConfig::default());
        let mut a = manager.admit(ctx("a")).await.unwrap();
        let mut b = manager.admit(ctx("b")).await.unwrap();
        let c = manager.admit(ctx("c")).await.unwrap();

        for admission in [&a, &b, &c] {
            manager
                .join_room(admission.connection.id, "lobby", RoomOptions::default())
                .unwrap();
        }

        let message = Message::new("chat.text", json!({"body": "hi"}), c.connection.id);
        let result = manager
            .broadcast("lobby", message, Some(c.connection.id))
            .await
            .unwrap();

        assert_eq!(result.attempted, 2);
        assert_eq!(result.delivered, 2);
        assert!(result.failures.is_empty());
        assert!(matches!(
            a.outbound.try_recv(),
            Ok(ServerFrame::Message { .. })
        ));
        assert!(matches!(
            b.outbound.try_recv(),
            Ok(ServerFrame::Message { .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_failures_do_not_abort_siblings() {
        let config = EngineConfig {
            outbound_queue_depth: 1,
            ..Default::default()
        };
        let manager = test_manager(config);
        let a = manager.admit(ctx("a")).await.unwrap();
        let mut b = manager.admit(ctx("b")).await.unwrap();

        manager
            .join_room(a.connection.id, "lobby", RoomOptions::default())
            .unwrap();
        manager
            .join_room(b.connection.id, "lobby", RoomOptions::default())
            .unwrap();

        // Saturate a's queue so the broadcast hits backpressure there
        a.connection.enqueue(ServerFrame::Ping).unwrap();

        let sender = Uuid::new_v4();
        let message = Message::new("chat.text", json!({}), sender);
        let result = manager.broadcast("lobby", message, None).await.unwrap();

        assert_eq!(result.attempted, 2);
        assert_eq!(result.delivered, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].connection_id, a.connection.id);
        assert!(matches!(result.failures[0].error, EngineError::Backpressure));
        assert!(matches!(
            b.outbound.try_recv(),
            Ok(ServerFrame::Message { .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_unknown_room() {
        let manager = test_manager(EngineConfig::default());
        let message = Message::new("chat.text", json!({}), Uuid::new_v4());

        let err = manager.broadcast("nowhere", message, None).await.unwrap_err();
        assert!(matches!(err, EngineError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_broadcast_snapshot_ignores_late_joiners() {
        let manager = test_manager(EngineConfig::default());
        let a = manager.admit(ctx("a")).await.unwrap();
        let mut late = manager.admit(ctx("late")).await.unwrap();

        manager
            .join_room(a.connection.id, "lobby", RoomOptions::default())
            .unwrap();

        let message = Message::new("chat.text", json!({}), Uuid::new_v4());
        let result = manager.broadcast("lobby", message, None).await.unwrap();
        assert_eq!(result.attempted, 1);

        // Joining after the snapshot does not receive the broadcast
        manager
            .join_room(late.connection.id, "lobby", RoomOptions::default())
            .unwrap();
        assert!(late.outbound.try_recv().is_err());
    }
}
