//! Monotonic clock of the engine.
//!
//! Read through tokio so a paused test runtime controls it.

use std::time::Instant;

pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
