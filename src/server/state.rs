use std::sync::Arc;

use crate::auth::JwtValidator;
use crate::config::Settings;
use crate::connection_manager::ConnectionManager;
use crate::middleware::{AuthGate, MetricsRecorder, MiddlewareChain, StructuredLogger};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt_validator: Arc<JwtValidator>,
    pub engine: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let jwt_validator = Arc::new(JwtValidator::new(&settings.jwt));

        let middleware = MiddlewareChain::new()
            .with(Arc::new(AuthGate))
            .with(Arc::new(StructuredLogger))
            .with(Arc::new(MetricsRecorder));
        let engine = Arc::new(ConnectionManager::with_middleware(
            settings.engine.clone(),
            middleware,
        ));

        Self {
            settings: Arc::new(settings),
            jwt_validator,
            engine,
        }
    }
}
