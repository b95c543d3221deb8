//! Counting semaphore
//!
//! Thread-level (not fiber-aware): `wait` parks the calling OS thread.
//! Useful for handing results out of fibers to plain threads, e.g. a
//! test main thread waiting for N fibers to finish.

use std::sync::{Condvar, Mutex};

/// Counting semaphore over a mutex and condvar
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Block until the count is positive, then take one
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Take one if available
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Add one and wake a waiter
    pub fn notify(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_one();
    }

    /// Add `n` and wake up to `n` waiters
    pub fn notify_many(&self, n: usize) {
        *self.count.lock().unwrap() += n;
        self.cond.notify_all();
    }
}
