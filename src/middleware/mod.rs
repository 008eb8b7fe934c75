//! Ordered lifecycle interceptors.
//!
//! Interceptors run strictly in registration order at each lifecycle
//! point; any rejection halts the remaining interceptors and fails the
//! triggering operation.

mod builtin;
mod chain;

pub use builtin::{AuthGate, MetricsRecorder, StructuredLogger};
pub use chain::{Middleware, MiddlewareChain};
