//! fd -> FdContext table
//!
//! Indexed by raw descriptor number. Grows geometrically (1.5x, floored
//! at fd + 1) under the write lock; lookups take the read lock.

use crate::fd_context::FdContext;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};

const INITIAL_CAPACITY: usize = 64;

/// Thread-safe map from descriptor to shared event context
pub struct FdContextTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdContextTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; INITIAL_CAPACITY]),
        }
    }

    /// Look up the context for `fd`, creating it when `auto_create`.
    /// Returns `None` for negative descriptors and for unknown ones when
    /// `auto_create` is false.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if let Some(ctx) = &slots[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let old = slots.len();
            let want = (idx + 1).max(old + old / 2);
            slots.resize(want, None);
            log::debug!("fd context table resized: old={}, new={}", old, want);
        }
        // Another writer may have created it between the locks.
        Some(
            slots[idx]
                .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
                .clone(),
        )
    }

    /// Drop the context for `fd`
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }

    /// Current table capacity (tests and diagnostics)
    pub fn capacity(&self) -> usize {
        self.slots.read().unwrap().len()
    }
}

impl Default for FdContextTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fd_without_autocreate() {
        let table = FdContextTable::new();
        assert!(table.get(5, false).is_none());
        assert!(table.get(-1, true).is_none());
    }

    #[test]
    fn test_autocreate_returns_same_context() {
        let table = FdContextTable::new();
        let a = table.get(5, true).unwrap();
        let b = table.get(5, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.fd(), 5);
    }

    #[test]
    fn test_geometric_growth() {
        let table = FdContextTable::new();
        assert_eq!(table.capacity(), 64);

        // Within capacity: no growth.
        table.get(10, true).unwrap();
        assert_eq!(table.capacity(), 64);

        // Just past capacity: 1.5x wins over fd + 1.
        table.get(64, true).unwrap();
        assert_eq!(table.capacity(), 96);

        // Far past capacity: fd + 1 wins.
        table.get(1000, true).unwrap();
        assert_eq!(table.capacity(), 1001);
    }

    #[test]
    fn test_remove() {
        let table = FdContextTable::new();
        table.get(5, true).unwrap();
        table.remove(5);
        assert!(table.get(5, false).is_none());
    }
}
