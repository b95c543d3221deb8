//! Per-descriptor event state machine
//!
//! Each registered fd has two one-shot waiter slots, one per direction.
//! A slot holds a fiber to reschedule or a bare callback, never both.
//! `trigger_event` consumes the slot atomically with respect to
//! `add`/`del`/`cancel` on the same direction and fires the waiter after
//! dropping the lock; re-registration from inside a callback installs a
//! fresh one-shot waiter.

use bitflags::bitflags;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use zfiber_runtime::{Fiber, Scheduler};

bitflags! {
    /// Registered event mask for one descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// One direction of readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

impl IoEvent {
    #[inline]
    pub fn as_set(self) -> EventSet {
        match self {
            IoEvent::Read => EventSet::READ,
            IoEvent::Write => EventSet::WRITE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IoEvent::Read => "read",
            IoEvent::Write => "write",
        }
    }
}

/// What to do when the descriptor becomes ready in one direction
pub enum Waiter {
    /// Reschedule this fiber on the scheduler
    Fiber(Arc<Fiber>),

    /// Run this callback (on the triggering thread)
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Waiter {
    fn fire(self, scheduler: &Scheduler) {
        match self {
            Waiter::Fiber(fiber) => scheduler.schedule(fiber),
            Waiter::Callback(cb) => cb(),
        }
    }
}

struct FdInner {
    events: EventSet,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdInner {
    fn slot(&mut self, event: IoEvent) -> &mut Option<Waiter> {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }
}

/// Event registration state for a single descriptor
pub struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    pub fn new(fd: RawFd) -> Self {
        log::trace!("fd context created: fd={}", fd);
        Self {
            fd,
            inner: Mutex::new(FdInner {
                events: EventSet::empty(),
                read: None,
                write: None,
            }),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current registered mask
    pub fn events(&self) -> EventSet {
        self.inner.lock().unwrap().events
    }

    /// Install `waiter` for `event` and OR the bit into the mask.
    /// Returns (mask before, mask after). Re-installation on an armed
    /// direction replaces the waiter; the mask update is idempotent.
    pub fn register(&self, event: IoEvent, waiter: Waiter) -> (EventSet, EventSet) {
        let mut inner = self.inner.lock().unwrap();
        if inner.events.contains(event.as_set()) {
            log::warn!(
                "fd context event already armed: fd={}, event={}",
                self.fd,
                event.name()
            );
        }
        let old = inner.events;
        *inner.slot(event) = Some(waiter);
        inner.events |= event.as_set();
        (old, inner.events)
    }

    /// Add the mask bit without touching the waiter slot. Idempotent.
    pub fn add_event(&self, event: IoEvent) -> EventSet {
        let mut inner = self.inner.lock().unwrap();
        inner.events |= event.as_set();
        inner.events
    }

    /// Clear the bit and drop the waiter without firing it
    pub fn del_event(&self, event: IoEvent) -> EventSet {
        let mut inner = self.inner.lock().unwrap();
        inner.events -= event.as_set();
        *inner.slot(event) = None;
        inner.events
    }

    /// Like `del_event`, but the waiter is fired first: a fiber is
    /// rescheduled (and will observe no data, surfacing the cancellation
    /// upstream), a callback is run. Fires outside the lock.
    pub fn cancel_event(&self, event: IoEvent, scheduler: &Scheduler) -> EventSet {
        let (waiter, remaining) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.events.contains(event.as_set()) {
                return inner.events;
            }
            inner.events -= event.as_set();
            (inner.slot(event).take(), inner.events)
        };
        if let Some(waiter) = waiter {
            log::debug!(
                "fd context cancel: fd={}, event={}",
                self.fd,
                event.name()
            );
            waiter.fire(scheduler);
        }
        remaining
    }

    /// Cancel both directions
    pub fn cancel_all(&self, scheduler: &Scheduler) {
        let (read, write) = {
            let mut inner = self.inner.lock().unwrap();
            inner.events = EventSet::empty();
            (inner.read.take(), inner.write.take())
        };
        if let Some(w) = read {
            w.fire(scheduler);
        }
        if let Some(w) = write {
            w.fire(scheduler);
        }
    }

    /// Consume the waiter for a direction that just became ready.
    ///
    /// One-shot: the slot is emptied and the bit cleared under the lock,
    /// then the waiter fires unlocked. Pairs with edge-triggered
    /// readiness; whoever installed the waiter re-installs if it wants
    /// another notification.
    pub fn trigger_event(&self, event: IoEvent, scheduler: &Scheduler) {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.events.contains(event.as_set()) {
                log::trace!(
                    "fd context trigger on unarmed event: fd={}, event={}",
                    self.fd,
                    event.name()
                );
                return;
            }
            inner.events -= event.as_set();
            inner.slot(event).take()
        };
        match waiter {
            Some(waiter) => waiter.fire(scheduler),
            None => log::warn!(
                "fd context armed with no waiter: fd={}, event={}",
                self.fd,
                event.name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_scheduler() -> Arc<Scheduler> {
        // Not started: scheduled fibers just sit in the queue, which is
        // all these tests need.
        Scheduler::new(1, "fd_ctx_test")
    }

    #[test]
    fn test_mask_is_idempotent() {
        let ctx = FdContext::new(7);
        assert_eq!(ctx.add_event(IoEvent::Read), EventSet::READ);
        assert_eq!(ctx.add_event(IoEvent::Read), EventSet::READ);
        assert_eq!(
            ctx.add_event(IoEvent::Write),
            EventSet::READ | EventSet::WRITE
        );
    }

    #[test]
    fn test_trigger_consumes_slot_once() {
        let sched = test_scheduler();
        let ctx = FdContext::new(3);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        ctx.register(
            IoEvent::Read,
            Waiter::Callback(Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        );

        ctx.trigger_event(IoEvent::Read, &sched);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.events(), EventSet::empty());

        // Second trigger finds nothing armed.
        ctx.trigger_event(IoEvent::Read, &sched);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_fires_matching_direction_only() {
        let sched = test_scheduler();
        let ctx = FdContext::new(3);
        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));

        let r = reads.clone();
        ctx.register(
            IoEvent::Read,
            Waiter::Callback(Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let w = writes.clone();
        ctx.register(
            IoEvent::Write,
            Waiter::Callback(Box::new(move || {
                w.fetch_add(1, Ordering::SeqCst);
            })),
        );

        ctx.trigger_event(IoEvent::Write, &sched);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.events(), EventSet::READ);
    }

    #[test]
    fn test_del_event_discards_waiter() {
        let sched = test_scheduler();
        let ctx = FdContext::new(3);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        ctx.register(
            IoEvent::Read,
            Waiter::Callback(Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        );

        ctx.del_event(IoEvent::Read);
        ctx.trigger_event(IoEvent::Read, &sched);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_fires_waiter() {
        let sched = test_scheduler();
        let ctx = FdContext::new(3);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        ctx.register(
            IoEvent::Read,
            Waiter::Callback(Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
        );

        ctx.cancel_event(IoEvent::Read, &sched);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.events(), EventSet::empty());
    }

    #[test]
    fn test_cancel_all_fires_both() {
        let sched = test_scheduler();
        let ctx = FdContext::new(3);
        let hits = Arc::new(AtomicUsize::new(0));
        for ev in [IoEvent::Read, IoEvent::Write] {
            let hits = hits.clone();
            ctx.register(
                ev,
                Waiter::Callback(Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        ctx.cancel_all(&sched);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.events(), EventSet::empty());
    }

    #[test]
    fn test_callback_may_reregister() {
        let sched = test_scheduler();
        let ctx = Arc::new(FdContext::new(3));
        let hits = Arc::new(AtomicUsize::new(0));

        let ctx2 = ctx.clone();
        let hits2 = hits.clone();
        ctx.register(
            IoEvent::Read,
            Waiter::Callback(Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
                // Fresh one-shot waiter from inside the firing callback.
                let hits3 = hits2.clone();
                ctx2.register(
                    IoEvent::Read,
                    Waiter::Callback(Box::new(move || {
                        hits3.fetch_add(1, Ordering::SeqCst);
                    })),
                );
            })),
        );

        ctx.trigger_event(IoEvent::Read, &sched);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.events(), EventSet::READ);

        ctx.trigger_event(IoEvent::Read, &sched);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
