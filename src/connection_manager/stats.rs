//! Read-only snapshots returned by registry queries.
//!
//! Queries never hand out live mutable references; every value here is
//! an owned copy taken under the registry lock.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::connection::ConnectionId;

/// Point-in-time view of a single connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub identity: Option<String>,
    pub origin: Option<IpAddr>,
    pub state: String,
    pub admitted_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub rooms: Vec<String>,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub id: String,
    pub members: Vec<ConnectionId>,
    pub capacity: Option<usize>,
    pub private: bool,
    pub created_at: DateTime<Utc>,
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_connections: usize,
    pub unique_identities: usize,
    pub rooms: HashMap<String, usize>,
}
