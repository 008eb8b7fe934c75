use std::sync::Arc;

use async_trait::async_trait;

use crate::connection_manager::Connection;
use crate::error::{CloseReason, EngineError, Result};
use crate::message::Message;

/// Lifecycle interceptor.
///
/// Implementations are stateless extension points; a rejection from
/// `on_connect` or `on_message` fails the triggering operation with the
/// interceptor's stated reason.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_connect(&self, connection: &Arc<Connection>) -> Result<()> {
        let _ = connection;
        Ok(())
    }

    async fn on_disconnect(&self, connection: &Arc<Connection>, reason: CloseReason) {
        let _ = (connection, reason);
    }

    async fn on_message(&self, connection: &Arc<Connection>, message: &Message) -> Result<()> {
        let _ = (connection, message);
        Ok(())
    }

    async fn on_error(&self, connection: Option<&Arc<Connection>>, error: &EngineError) {
        let _ = (connection, error);
    }
}

/// Ordered interceptor chain, executed strictly in registration order.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    interceptors: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    pub fn with(mut self, interceptor: Arc<dyn Middleware>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Middleware>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `on_connect` across the chain; the first rejection halts the
    /// remaining interceptors and aborts the admission.
    pub async fn on_connect(&self, connection: &Arc<Connection>) -> Result<()> {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.on_connect(connection).await {
                tracing::debug!(
                    connection_id = %connection.id,
                    interceptor = interceptor.name(),
                    error = %e,
                    "Interceptor rejected connection"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn on_disconnect(&self, connection: &Arc<Connection>, reason: CloseReason) {
        for interceptor in &self.interceptors {
            interceptor.on_disconnect(connection, reason).await;
        }
    }

    /// Run `on_message` across the chain; the first rejection halts the
    /// remaining interceptors and fails the dispatch.
    pub async fn on_message(&self, connection: &Arc<Connection>, message: &Message) -> Result<()> {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.on_message(connection, message).await {
                tracing::debug!(
                    connection_id = %connection.id,
                    interceptor = interceptor.name(),
                    error = %e,
                    "Interceptor rejected message"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn on_error(&self, connection: Option<&Arc<Connection>>, error: &EngineError) {
        for interceptor in &self.interceptors {
            interceptor.on_error(connection, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use crate::config::EngineConfig;
    use crate::connection_manager::HandshakeContext;

    struct Counting {
        calls: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl Middleware for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn on_connect(&self, _connection: &Arc<Connection>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                Err(EngineError::AdmissionDenied("rejected by test".into()))
            } else {
                Ok(())
            }
        }
    }

    fn test_connection() -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(4);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let ctx = HandshakeContext::new(Some("user-1".into()), ip);
        Arc::new(Connection::new(&ctx, tx, &EngineConfig::default()))
    }

    #[tokio::test]
    async fn test_rejection_halts_remaining_interceptors() {
        let first = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            reject: true,
        });
        let second = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            reject: false,
        });

        let chain = MiddlewareChain::new()
            .with(first.clone())
            .with(second.clone());

        let conn = test_connection();
        let result = chain.on_connect(&conn).await;

        assert!(matches!(result, Err(EngineError::AdmissionDenied(_))));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order() {
        let first = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            reject: false,
        });
        let second = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            reject: false,
        });

        let chain = MiddlewareChain::new()
            .with(first.clone())
            .with(second.clone());

        let conn = test_connection();
        assert!(chain.on_connect(&conn).await.is_ok());
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }
}
