//! WebSocket transport adapter.
//!
//! Bridges socket frames to engine operations: upgrade and handshake,
//! the per-connection outbound drain loop and the inbound read loop.

mod handler;
mod message;

pub use handler::{ws_handler, WsQuery};
pub use message::{ClientFrame, ServerFrame};
