//! Built-in interceptors: authentication gate, structured logger,
//! metrics recorder.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection_manager::Connection;
use crate::error::{CloseReason, EngineError, Result};
use crate::message::Message;
use crate::metrics::{ERRORS_TOTAL, MESSAGES_RECEIVED_TOTAL};

use super::chain::Middleware;

/// Rejects admissions that arrive without a verified identity.
///
/// Credential verification itself happens upstream in the handshake
/// layer; this gate only enforces that an identity was supplied.
pub struct AuthGate;

#[async_trait]
impl Middleware for AuthGate {
    fn name(&self) -> &'static str {
        "auth_gate"
    }

    async fn on_connect(&self, connection: &Arc<Connection>) -> Result<()> {
        if connection.identity.is_none() {
            return Err(EngineError::AuthenticationRequired);
        }
        Ok(())
    }
}

/// Logs lifecycle events with structured fields.
pub struct StructuredLogger;

#[async_trait]
impl Middleware for StructuredLogger {
    fn name(&self) -> &'static str {
        "structured_logger"
    }

    async fn on_connect(&self, connection: &Arc<Connection>) -> Result<()> {
        tracing::info!(
            connection_id = %connection.id,
            identity = connection.identity.as_deref().unwrap_or("-"),
            origin = ?connection.origin,
            "Connection admitted"
        );
        Ok(())
    }

    async fn on_disconnect(&self, connection: &Arc<Connection>, reason: CloseReason) {
        tracing::info!(
            connection_id = %connection.id,
            identity = connection.identity.as_deref().unwrap_or("-"),
            reason = %reason,
            "Connection removed"
        );
    }

    async fn on_message(&self, connection: &Arc<Connection>, message: &Message) -> Result<()> {
        tracing::debug!(
            connection_id = %connection.id,
            message_id = %message.id,
            kind = %message.kind,
            room = message.room_id.as_deref().unwrap_or("-"),
            correlation_id = ?message.correlation_id,
            "Message accepted"
        );
        Ok(())
    }

    async fn on_error(&self, connection: Option<&Arc<Connection>>, error: &EngineError) {
        match connection {
            Some(conn) => tracing::warn!(
                connection_id = %conn.id,
                kind = error.kind(),
                error = %error,
                "Engine error"
            ),
            None => tracing::warn!(kind = error.kind(), error = %error, "Engine error"),
        }
    }
}

/// Records message and error counters.
pub struct MetricsRecorder;

#[async_trait]
impl Middleware for MetricsRecorder {
    fn name(&self) -> &'static str {
        "metrics_recorder"
    }

    async fn on_message(&self, _connection: &Arc<Connection>, message: &Message) -> Result<()> {
        MESSAGES_RECEIVED_TOTAL
            .with_label_values(&[&message.kind])
            .inc();
        Ok(())
    }

    async fn on_error(&self, _connection: Option<&Arc<Connection>>, error: &EngineError) {
        ERRORS_TOTAL.with_label_values(&[error.kind()]).inc();
    }
}
