//! Fiber identifiers
//!
//! Every fiber gets a process-wide unique, monotonically increasing
//! 64-bit id. Ids are never reused, even when the fiber object itself is
//! recycled through the fiber pool.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Process-wide fiber id counter
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique fiber identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw 64-bit value
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
