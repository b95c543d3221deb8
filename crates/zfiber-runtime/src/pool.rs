//! Fiber pool
//!
//! Recycles terminated fibers so a busy scheduler does not pay a stack
//! mmap per task. `acquire` hands back a reset idle fiber or creates a
//! fresh one; `release` returns a terminated fiber, dropping it when the
//! pool is full.

use crate::fiber::Fiber;
use crate::stack::DEFAULT_STACK_SIZE;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Default capacity of the process-wide pool
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

struct PoolInner {
    idle: VecDeque<Arc<Fiber>>,
    capacity: usize,
}

/// Bounded pool of terminated fibers available for reuse
pub struct FiberPool {
    inner: Mutex<PoolInner>,
    total_created: AtomicU64,
    total_reused: AtomicU64,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatistics {
    /// Fibers created because the pool was empty
    pub total_created: u64,
    /// Fibers handed out from the idle list
    pub total_reused: u64,
    /// Idle fibers currently pooled
    pub idle_count: usize,
}

impl FiberPool {
    pub fn new(capacity: usize) -> Self {
        log::info!("fiber pool created: capacity={}", capacity);
        Self {
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                capacity,
            }),
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
        }
    }

    /// Process-wide shared pool
    pub fn global() -> &'static FiberPool {
        static GLOBAL: OnceLock<FiberPool> = OnceLock::new();
        GLOBAL.get_or_init(|| FiberPool::new(DEFAULT_POOL_CAPACITY))
    }

    /// Pop an idle fiber and reset it with `entry`, or create a new one
    /// when the pool is empty.
    pub fn acquire<F>(&self, entry: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let recycled = self.inner.lock().unwrap().idle.pop_front();
        match recycled {
            Some(fiber) => {
                // Pooled fibers are terminated by construction; reset
                // cannot fail on them.
                fiber
                    .reset(entry)
                    .expect("pooled fiber was not terminated");
                self.total_reused.fetch_add(1, Ordering::Relaxed);
                log::trace!("fiber pool reuse: id={}", fiber.id());
                fiber
            }
            None => {
                self.total_created.fetch_add(1, Ordering::Relaxed);
                Fiber::new(entry, DEFAULT_STACK_SIZE, Some("pooled"))
            }
        }
    }

    /// Return a terminated fiber to the pool.
    ///
    /// A non-terminated fiber is refused (no-op); when the pool is at
    /// capacity the fiber is simply dropped.
    pub fn release(&self, fiber: Arc<Fiber>) {
        if !fiber.state().is_terminated() {
            log::warn!(
                "fiber pool refused non-terminated fiber: id={}, state={}",
                fiber.id(),
                fiber.state()
            );
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.idle.len() >= inner.capacity {
            log::debug!(
                "fiber pool full, dropping fiber: id={}, capacity={}",
                fiber.id(),
                inner.capacity
            );
            return;
        }
        inner.idle.push_back(fiber);
    }

    /// Shrink the capacity to `capacity`, dropping surplus idle fibers
    pub fn resize(&self, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity;
        while inner.idle.len() > capacity {
            inner.idle.pop_back();
        }
    }

    /// Drop every idle fiber and zero the counters
    pub fn clear(&self) {
        self.total_created.store(0, Ordering::Relaxed);
        self.total_reused.store(0, Ordering::Relaxed);
        self.inner.lock().unwrap().idle.clear();
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().unwrap().idle.len()
    }

    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
            idle_count: self.idle_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn terminated_fiber() -> Arc<Fiber> {
        let fiber = Fiber::new(|| {}, DEFAULT_STACK_SIZE, None);
        fiber.resume().unwrap();
        fiber
    }

    #[test]
    fn test_acquire_creates_then_reuses() {
        std::thread::spawn(|| {
            let pool = FiberPool::new(4);
            let fiber = pool.acquire(|| {});
            assert_eq!(pool.statistics().total_created, 1);

            fiber.resume().unwrap();
            let id = fiber.id();
            pool.release(fiber);
            assert_eq!(pool.idle_count(), 1);

            let again = pool.acquire(|| {});
            assert_eq!(again.id(), id);
            let stats = pool.statistics();
            assert_eq!(stats.total_reused, 1);
            assert_eq!(stats.idle_count, 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_reused_fiber_runs_new_entry() {
        std::thread::spawn(|| {
            let pool = FiberPool::new(4);
            let hits = Arc::new(AtomicUsize::new(0));

            let fiber = pool.acquire(|| {});
            fiber.resume().unwrap();
            pool.release(fiber);

            let hits2 = hits.clone();
            let fiber = pool.acquire(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            });
            fiber.resume().unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_release_refuses_non_terminated() {
        let pool = FiberPool::new(4);
        let fiber = Fiber::new(|| {}, DEFAULT_STACK_SIZE, None);
        pool.release(fiber);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_release_when_full_drops() {
        std::thread::spawn(|| {
            let pool = FiberPool::new(2);
            for _ in 0..5 {
                pool.release(terminated_fiber());
            }
            assert_eq!(pool.idle_count(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_resize_trims_idle() {
        std::thread::spawn(|| {
            let pool = FiberPool::new(8);
            for _ in 0..6 {
                pool.release(terminated_fiber());
            }
            pool.resize(3);
            assert_eq!(pool.idle_count(), 3);
            // New capacity is enforced for future releases too.
            pool.release(terminated_fiber());
            assert_eq!(pool.idle_count(), 3);
        })
        .join()
        .unwrap();
    }
}
