//! Connection and room registry.
//!
//! The `ConnectionManager` is the sole authority over connection and
//! room lifecycle; rooms and connections reference each other only
//! through its index tables.

mod connection;
mod registry;
mod room;
mod stats;

pub use connection::{Connection, ConnectionId, ConnectionState, HandshakeContext};
pub use registry::{Admission, BroadcastFailure, BroadcastResult, ConnectionManager};
pub use room::{is_valid_room_id, Room, RoomOptions, MAX_ROOM_ID_LEN};
pub use stats::{ConnectionSnapshot, EngineStats, RoomSnapshot};
