//! Monotonic millisecond clock
//!
//! Timer deadlines are absolute milliseconds on a process-local
//! monotonic epoch (the first call to `now_ms`). A wall clock would let
//! NTP steps stall or storm the timer heap.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the process-local monotonic epoch
#[inline]
pub fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
