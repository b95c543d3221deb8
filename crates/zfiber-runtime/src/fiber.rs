//! Fibers: stackful user-space coroutines
//!
//! A fiber owns (or borrows, in shared-stack mode) a stack and a saved
//! machine context. `resume` swaps from the caller into the fiber;
//! `yield_now` swaps from the running fiber back to its switch target.
//!
//! Switch-target rule: a yielding or terminating fiber returns to the
//! thread's scheduler fiber when one is installed (and it is not itself
//! the scheduler fiber), otherwise to the thread's main fiber. User
//! fibers therefore never swap directly to one another; they always go
//! through the scheduler fiber, giving the three-level hierarchy
//! main <-> scheduler <-> user.

use crate::ctx::MachineContext;
use crate::current_arch;
use crate::shared_stack::{self, SharedBinding, SharedStackArena};
use crate::stack::OwnedStack;
use crate::tls;
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use zfiber_core::{FiberError, FiberId, FiberResult, FiberState};

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// What the fiber runs on
enum StackBinding {
    /// Placeholder for a thread's original context; no stack of its own
    Main,

    /// A stack dedicated to this fiber for its lifetime
    Owned(OwnedStack),

    /// A slot in a shared-stack arena, borrowed while running
    Shared(SharedBinding),
}

/// A stackful coroutine
pub struct Fiber {
    id: FiberId,
    name: String,
    state: AtomicU8,
    weak_self: Weak<Fiber>,
    ctx: UnsafeCell<MachineContext>,
    stack: StackBinding,

    /// True from just before a yielding fiber publishes Suspended until
    /// the moment its register save has completed. A waiter can fire and
    /// reschedule the fiber on another worker inside that window; the
    /// resumer spins on this flag so it never loads a half-saved context.
    switch_pending: AtomicBool,

    /// Entry function; consumed by the first resume after new/reset
    entry: UnsafeCell<Option<EntryFn>>,

    /// Panic payload captured by the entry guard, re-raised on the next
    /// resume
    panic: UnsafeCell<Option<Box<dyn Any + Send + 'static>>>,
}

// Safety: a fiber is shared between threads (task queue, fd waiter
// slots), but its context, entry and panic slots are only touched by the
// thread that currently has it resumed, and the state machine (atomic)
// guarantees at most one such thread at a time. The stack bindings are
// private to the same discipline.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with its own stack.
    ///
    /// `name` is decorated with the fiber id (`name_<id>`); with no name
    /// the fiber is called `fiber_<id>`.
    ///
    /// # Panics
    ///
    /// Stack allocation failure is fatal.
    pub fn new<F>(entry: F, stack_size: usize, name: Option<&str>) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = OwnedStack::new(stack_size)
            .unwrap_or_else(|e| panic!("fiber stack allocation failed: {}", e));
        let fiber = Self::build(StackBinding::Owned(stack), Some(Box::new(entry)), name);
        fiber.init_entry_context();
        log::debug!(
            "fiber created: name={}, id={}, stack_size={}",
            fiber.name,
            fiber.id,
            stack_size
        );
        fiber
    }

    /// Create a fiber on a shared-stack arena. The buffer is assigned
    /// round-robin and borrowed only while the fiber runs.
    pub fn new_shared<F>(entry: F, arena: &Arc<SharedStackArena>, name: Option<&str>) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let binding = SharedBinding {
            arena: arena.clone(),
            index: arena.assign(),
            save: UnsafeCell::new(Vec::new()),
        };
        let fiber = Self::build(StackBinding::Shared(binding), Some(Box::new(entry)), name);
        fiber.init_entry_context();
        log::debug!(
            "fiber created on shared stack: name={}, id={}, buffer={}",
            fiber.name,
            fiber.id,
            match &fiber.stack {
                StackBinding::Shared(b) => b.index,
                _ => unreachable!(),
            }
        );
        fiber
    }

    /// Placeholder fiber capturing a thread's original context. Its
    /// machine context is written by the first switch away from the
    /// thread; it has no entry and cannot be resumed.
    pub(crate) fn main_for_thread() -> Arc<Fiber> {
        let fiber = Self::build(StackBinding::Main, None, Some("main"));
        fiber.state.store(FiberState::Running as u8, Ordering::Release);
        fiber
    }

    fn build(stack: StackBinding, entry: Option<EntryFn>, name: Option<&str>) -> Arc<Fiber> {
        let id = FiberId::next();
        let name = match name {
            Some(n) if !n.is_empty() => format!("{}_{}", n, id),
            _ => format!("fiber_{}", id),
        };
        Arc::new_cyclic(|weak| Fiber {
            id,
            name,
            state: AtomicU8::new(FiberState::Ready as u8),
            weak_self: weak.clone(),
            ctx: UnsafeCell::new(MachineContext::zeroed()),
            stack,
            switch_pending: AtomicBool::new(false),
            entry: UnsafeCell::new(entry),
            panic: UnsafeCell::new(None),
        })
    }

    /// Point the context at the entry trampoline on this fiber's stack
    fn init_entry_context(&self) {
        let top = match &self.stack {
            StackBinding::Owned(s) => s.top(),
            StackBinding::Shared(b) => b.arena.buffer(b.index).top(),
            StackBinding::Main => unreachable!("main fiber has no entry context"),
        };
        unsafe {
            current_arch::init_context(
                self.ctx.get(),
                top,
                fiber_main as usize,
                self as *const Fiber as usize,
            );
        }
    }

    /// Fiber currently executing on the calling thread
    #[inline]
    pub fn current() -> Option<Arc<Fiber>> {
        tls::current_fiber()
    }

    /// Resume this fiber on the calling thread.
    ///
    /// Control returns when the fiber next suspends or terminates. If
    /// the fiber terminated with a captured panic, the panic is re-raised
    /// here after control returns.
    ///
    /// Fails with `IllegalState` unless the fiber is Ready or Suspended.
    pub fn resume(&self) -> FiberResult<()> {
        let observed = self.state();
        if !observed.is_resumable() {
            return Err(FiberError::IllegalState("resume requires a ready or suspended fiber"));
        }
        // Claim the transition; loses cleanly if another thread got here
        // first.
        if self
            .state
            .compare_exchange(
                observed as u8,
                FiberState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(FiberError::IllegalState("fiber resumed concurrently"));
        }

        // If the fiber was woken so fast that its previous owner is still
        // mid-switch, wait for the register save to land. The window is a
        // handful of instructions.
        while self.switch_pending.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }

        let this = self
            .weak_self
            .upgrade()
            .expect("resume on a fiber with no strong reference");
        let prev = current_or_implicit_main();
        if Arc::ptr_eq(&prev, &this) {
            self.state.store(observed as u8, Ordering::Release);
            return Err(FiberError::IllegalState("fiber cannot resume itself"));
        }

        tls::set_current_fiber(Some(this.clone()));
        switch_fibers(&prev, &this);

        // The fiber suspended or terminated; we are back on the caller.
        tls::set_current_fiber(Some(prev));
        if self.state().is_terminated() {
            let payload = unsafe { (*self.panic.get()).take() };
            if let Some(payload) = payload {
                std::panic::resume_unwind(payload);
            }
        }
        Ok(())
    }

    /// Suspend the currently running fiber and switch to its target.
    ///
    /// Fails with `NoCurrentFiber` outside a fiber, `IllegalState` when
    /// the current fiber is not running (e.g. a bare thread's main
    /// placeholder with nothing to switch to).
    pub fn yield_now() -> FiberResult<()> {
        let cur = tls::current_fiber().ok_or(FiberError::NoCurrentFiber)?;
        if !cur.state().can_yield() {
            return Err(FiberError::IllegalState("yield requires a running fiber"));
        }
        // Raise the switch fence before Suspended becomes visible: anyone
        // observing Suspended must also observe the fence and wait out
        // the register save.
        cur.switch_pending.store(true, Ordering::Relaxed);
        cur.set_state(FiberState::Suspended);
        if let Err(e) = cur.switch_to_target() {
            cur.set_state(FiberState::Running);
            cur.switch_pending.store(false, Ordering::Release);
            return Err(e);
        }
        // Resumed.
        Ok(())
    }

    /// Return a terminated fiber to Ready with a new entry and a cleared
    /// panic slot. Used by the fiber pool to recycle fibers.
    pub fn reset<F>(&self, entry: F) -> FiberResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.state().is_terminated() {
            return Err(FiberError::IllegalState("reset requires a terminated fiber"));
        }
        match &self.stack {
            StackBinding::Main => {
                return Err(FiberError::IllegalState("main fiber cannot be reset"))
            }
            StackBinding::Shared(b) => b.release(self as *const Fiber),
            StackBinding::Owned(_) => {}
        }
        unsafe {
            *self.entry.get() = Some(Box::new(entry));
            *self.panic.get() = None;
        }
        self.init_entry_context();
        self.set_state(FiberState::Ready);
        log::debug!("fiber reset: name={}, id={}", self.name, self.id);
        Ok(())
    }

    /// Fiber name (`name_<id>` or `fiber_<id>`)
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process-wide unique id
    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    /// True when this fiber borrows a shared-stack buffer
    #[inline]
    pub fn is_shared_stack(&self) -> bool {
        matches!(self.stack, StackBinding::Shared(_))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn ctx_ptr(&self) -> *mut MachineContext {
        self.ctx.get()
    }

    #[inline]
    pub(crate) fn shared_binding(&self) -> Option<&SharedBinding> {
        match &self.stack {
            StackBinding::Shared(b) => Some(b),
            _ => None,
        }
    }

    /// Swap from this fiber to the thread's scheduler fiber, or to the
    /// main fiber when this is the scheduler fiber (or none is
    /// installed).
    pub(crate) fn switch_to_target(&self) -> FiberResult<()> {
        let target = match tls::scheduler_fiber() {
            Some(s) if !std::ptr::eq(Arc::as_ptr(&s), self as *const Fiber) => s,
            _ => tls::main_fiber().ok_or(FiberError::IllegalState("no switch target fiber"))?,
        };
        if std::ptr::eq(Arc::as_ptr(&target), self as *const Fiber) {
            return Err(FiberError::IllegalState("no switch target fiber"));
        }
        tls::set_current_fiber(Some(target.clone()));
        switch_fibers(self, &target);
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if let StackBinding::Shared(b) = &self.stack {
            b.release(self as *const Fiber);
        }
        log::trace!("fiber dropped: name={}, id={}", self.name, self.id);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("shared_stack", &self.is_shared_stack())
            .finish()
    }
}

thread_local! {
    /// The fiber whose context the most recent switch on this thread
    /// saved. The code that lands on the other side drops its switch
    /// fence (see `Fiber::switch_pending`).
    static LAST_SWITCHED_FROM: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
}

/// Drop the switch fence of the fiber that was just switched away from
/// on this thread. Runs as the first code on the landing side of every
/// switch; by then the outgoing register save has completed on this same
/// thread, so the Release store publishes it.
fn finish_pending_switch() {
    let from = LAST_SWITCHED_FROM.with(|c| c.replace(std::ptr::null()));
    if !from.is_null() {
        unsafe {
            (*from).switch_pending.store(false, Ordering::Release);
        }
    }
}

/// Swap contexts, routing through the shared-stack trampoline when
/// either side borrows a shared buffer.
fn switch_fibers(from: &Fiber, to: &Fiber) {
    LAST_SWITCHED_FROM.with(|c| c.set(from as *const Fiber));
    if from.is_shared_stack() || to.is_shared_stack() {
        shared_stack::shared_switch(from, to);
    } else {
        unsafe {
            current_arch::context_switch(from.ctx_ptr(), to.ctx_ptr());
        }
    }
    // This context has been resumed by a switch that is now complete.
    finish_pending_switch();
}

/// The current fiber, or a lazily-installed main placeholder for
/// threads that resume fibers without a scheduler.
fn current_or_implicit_main() -> Arc<Fiber> {
    if let Some(cur) = tls::current_fiber() {
        return cur;
    }
    let main = tls::implicit_main().unwrap_or_else(|| {
        let main = Fiber::main_for_thread();
        tls::set_implicit_main(Some(main.clone()));
        main
    });
    if tls::main_fiber().is_none() {
        tls::set_main_fiber(Some(main.clone()));
    }
    tls::set_current_fiber(Some(main.clone()));
    main
}

/// Entry guard running inside the fiber. Consumes the entry function,
/// catches any panic for re-raise on the next resume, marks the fiber
/// terminated and switches back to the target. Never returns.
extern "C" fn fiber_main(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };
    finish_pending_switch();

    let entry = unsafe { (*fiber.entry.get()).take() };
    match entry {
        Some(f) => {
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
                log::error!(
                    "fiber terminated by panic: name={}, id={}",
                    fiber.name(),
                    fiber.id()
                );
                unsafe {
                    *fiber.panic.get() = Some(payload);
                }
            } else {
                log::debug!(
                    "fiber terminated normally: name={}, id={}",
                    fiber.name(),
                    fiber.id()
                );
            }
        }
        None => log::error!(
            "fiber resumed with no entry function: name={}, id={}",
            fiber.name(),
            fiber.id()
        ),
    }

    fiber.set_state(FiberState::Terminated);
    if fiber.switch_to_target().is_err() {
        // A terminated fiber with nowhere to go cannot unwind across the
        // context-switch boundary; this is unrecoverable.
        log::error!("terminated fiber has no switch target; aborting");
        std::process::abort();
    }
    unreachable!("terminated fiber resumed without reset");
}
