//! Named broadcast targets.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::connection::ConnectionId;

/// Maximum length of a room id.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Per-join options applied when a room is created lazily.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomOptions {
    pub capacity: Option<usize>,
    pub private: bool,
}

/// A named, capacity-bounded set of connection ids.
///
/// Rooms never hold connection handles; cross-navigation always goes
/// through the registry's index tables.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub members: HashSet<ConnectionId>,
    pub created_at: DateTime<Utc>,
    pub capacity: Option<usize>,
    pub private: bool,
}

impl Room {
    pub fn new(id: impl Into<String>, options: RoomOptions) -> Self {
        Self {
            id: id.into(),
            members: HashSet::new(),
            created_at: Utc::now(),
            capacity: options.capacity,
            private: options.private,
        }
    }

    pub fn is_full(&self) -> bool {
        match self.capacity {
            Some(capacity) => self.members.len() >= capacity,
            None => false,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Validate a room id: `[a-z0-9._-]`, 1 to 64 chars.
pub fn is_valid_room_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_ROOM_ID_LEN {
        return false;
    }

    id.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-')
}
