//! Thread-local runtime context
//!
//! Each OS thread tracks the fiber currently executing on it, the
//! thread's main-fiber placeholder, the scheduler fiber running the
//! dispatch loop (workers only), the owning scheduler, and the per-thread
//! switch stack used by shared-stack swaps.
//!
//! Accessors clone out of the thread-local cell and release the borrow
//! immediately; nothing here is ever held across a context switch.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::shared_stack::SwitchStack;
use std::cell::RefCell;
use std::sync::Arc;

#[derive(Default)]
struct ThreadContext {
    /// Fiber currently executing on this thread
    current: Option<Arc<Fiber>>,

    /// Placeholder capturing the thread's original context
    main: Option<Arc<Fiber>>,

    /// The fiber running the dispatch loop (worker threads only)
    scheduler_fiber: Option<Arc<Fiber>>,

    /// Lazily-created main fiber for threads that resume fibers without
    /// a scheduler (standalone use)
    implicit_main: Option<Arc<Fiber>>,

    /// Scheduler owning this worker thread
    scheduler: Option<Arc<Scheduler>>,

    /// Trampoline stack for shared-stack save/restore; lazily created
    switch_stack: Option<Box<SwitchStack>>,
}

thread_local! {
    static CONTEXT: RefCell<ThreadContext> = RefCell::new(ThreadContext::default());
}

/// Fiber currently executing on this thread
#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CONTEXT.with(|c| c.borrow().current.clone())
}

#[inline]
pub fn set_current_fiber(fiber: Option<Arc<Fiber>>) {
    CONTEXT.with(|c| c.borrow_mut().current = fiber);
}

/// This thread's main-fiber placeholder
#[inline]
pub fn main_fiber() -> Option<Arc<Fiber>> {
    CONTEXT.with(|c| c.borrow().main.clone())
}

#[inline]
pub fn set_main_fiber(fiber: Option<Arc<Fiber>>) {
    CONTEXT.with(|c| c.borrow_mut().main = fiber);
}

/// This worker thread's scheduler fiber
#[inline]
pub fn scheduler_fiber() -> Option<Arc<Fiber>> {
    CONTEXT.with(|c| c.borrow().scheduler_fiber.clone())
}

#[inline]
pub fn set_scheduler_fiber(fiber: Option<Arc<Fiber>>) {
    CONTEXT.with(|c| c.borrow_mut().scheduler_fiber = fiber);
}

#[inline]
pub(crate) fn implicit_main() -> Option<Arc<Fiber>> {
    CONTEXT.with(|c| c.borrow().implicit_main.clone())
}

#[inline]
pub(crate) fn set_implicit_main(fiber: Option<Arc<Fiber>>) {
    CONTEXT.with(|c| c.borrow_mut().implicit_main = fiber);
}

/// Scheduler owning this worker thread, if any
#[inline]
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CONTEXT.with(|c| c.borrow().scheduler.clone())
}

#[inline]
pub fn set_current_scheduler(scheduler: Option<Arc<Scheduler>>) {
    CONTEXT.with(|c| c.borrow_mut().scheduler = scheduler);
}

/// This thread's switch stack, created on first use.
///
/// Returns a raw pointer so the caller does not hold the thread-local
/// borrow across a context switch. The box lives until `reset` or thread
/// exit, and shared-stack swaps complete strictly before either.
#[inline]
pub(crate) fn switch_stack() -> *mut SwitchStack {
    CONTEXT.with(|c| {
        let mut ctx = c.borrow_mut();
        let boxed = ctx.switch_stack.get_or_insert_with(SwitchStack::new_boxed);
        &mut **boxed as *mut SwitchStack
    })
}

/// True when this thread is currently inside a fiber (the current fiber
/// exists and is not the thread's main placeholder)
#[inline]
pub fn is_in_fiber() -> bool {
    CONTEXT.with(|c| {
        let ctx = c.borrow();
        match (&ctx.current, &ctx.main) {
            (Some(cur), Some(main)) => !Arc::ptr_eq(cur, main),
            (Some(_), None) => true,
            _ => false,
        }
    })
}

/// Restore this thread's context to its defaults
pub fn reset() {
    CONTEXT.with(|c| *c.borrow_mut() = ThreadContext::default());
}
