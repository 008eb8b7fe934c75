use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope of a connection ceiling that was exceeded at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityScope {
    Global,
    Identity,
    Origin,
}

impl std::fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Identity => write!(f, "identity"),
            Self::Origin => write!(f, "origin"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Connection limit exceeded for {scope} ({current}/{max})")]
    CapacityExceeded {
        scope: CapacityScope,
        current: usize,
        max: usize,
    },

    #[error("Admission denied: {0}")]
    AdmissionDenied(String),

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Outbound queue is full")]
    Backpressure,

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room {room} is full ({capacity} members)")]
    RoomFull { room: String, capacity: usize },

    #[error("Connection is closing or closed")]
    ConnectionClosed,

    #[error("Heartbeat timed out")]
    HeartbeatTimeout,

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable label for the errors-by-kind counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::AdmissionDenied(_) => "admission_denied",
            Self::AuthenticationRequired => "authentication_required",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ValidationFailed(_) => "validation_failed",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Backpressure => "backpressure",
            Self::RoomNotFound(_) => "room_not_found",
            Self::RoomFull { .. } => "room_full",
            Self::ConnectionClosed => "connection_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Wire-facing error code sent back to the peer in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::AdmissionDenied(_) => "ADMISSION_DENIED",
            Self::AuthenticationRequired => "AUTH_REQUIRED",
            Self::AuthenticationFailed(_) => "AUTH_FAILED",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Backpressure => "BACKPRESSURE",
            Self::RoomNotFound(_) => "ROOM_NOT_FOUND",
            Self::RoomFull { .. } => "ROOM_FULL",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::IdleTimeout => "IDLE_TIMEOUT",
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Hard failures always close the connection; soft failures are
    /// reported to the caller and leave connection state untouched.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            Self::HeartbeatTimeout
                | Self::IdleTimeout
                | Self::ProtocolViolation(_)
                | Self::Internal(_)
        )
    }
}

/// Reason attached to a connection closure, reported to the peer as part
/// of the closure notice when delivery is still possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Peer closed the channel or the application asked for a normal close.
    Normal,
    HeartbeatTimeout,
    IdleTimeout,
    ProtocolViolation,
    ServerShutdown,
    /// A middleware interceptor rejected the connection during admission.
    AdmissionRejected,
    /// The underlying transport failed.
    TransportError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::ServerShutdown => "server_shutdown",
            Self::AdmissionRejected => "admission_rejected",
            Self::TransportError => "transport_error",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
