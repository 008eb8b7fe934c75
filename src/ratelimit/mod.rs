//! Per-connection inbound rate limiting.
//!
//! Each connection owns a sliding window of recent message timestamps;
//! exceeding the limit rejects messages softly until the window slides.

mod sliding_window;

pub use sliding_window::{RateLimitDecision, SlidingWindow};
