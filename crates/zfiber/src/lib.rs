//! # zfiber - stackful coroutines for Linux
//!
//! A user-space coroutine runtime: many lightweight, cooperatively
//! scheduled fibers multiplexed over a fixed pool of worker threads,
//! with blocking-style I/O driven to completion by a single
//! edge-triggered epoll reactor, and a libc-interposition layer that
//! turns ordinary blocking syscalls into cooperative suspension points.
//!
//! ## Quick start
//!
//! ```ignore
//! use zfiber::{Reactor, Fiber, set_hook_enabled};
//!
//! let reactor = Reactor::new(4, "app").unwrap();
//! reactor.start();
//!
//! reactor.schedule_fn(|| {
//!     // Blocking-looking code; the worker thread stays free.
//!     set_hook_enabled(true);
//!     let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
//!     // ... connect / read / write suspend this fiber instead of the
//!     // thread ...
//! });
//!
//! reactor.stop();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       user code                          │
//! │     spawn / schedule, hooked read/write/accept/sleep     │
//! └──────────────────────────────────────────────────────────┘
//!                │ tasks                     │ fd waits, timers
//!                ▼                           ▼
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │        Scheduler         │◄──│         Reactor          │
//! │  workers, task queue,    │   │  epoll poller, fd table, │
//! │  main/scheduler fibers   │   │  timer heap, wake pipe   │
//! └──────────────────────────┘   └──────────────────────────┘
//!                │
//!                ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   Fibers: owned or shared stacks, machine-context swap   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub use zfiber_core::{FiberError, FiberId, FiberResult, FiberState, Semaphore, SpinLock};

pub use zfiber_runtime::{
    Fiber, FiberPool, PoolStatistics, RuntimeConfig, Scheduler, SharedStackArena, Task, TaskQueue,
    DEFAULT_STACK_SIZE,
};

pub use zfiber_io::{
    clock, is_hook_enabled, set_connect_timeout_ms, set_hook_enabled, EventSet, FdContext,
    FdContextTable, FdMetaTable, FdMetadata, IoEvent, Poller, Reactor, TimeoutKind, Timer,
    TimerHeap,
};

/// Schedule a callable on the default global reactor, starting it on
/// first use.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    Reactor::global().schedule_fn(f);
}

/// Yield the current fiber back to its scheduler.
///
/// Fails with `NoCurrentFiber` outside a fiber.
#[inline]
pub fn yield_now() -> FiberResult<()> {
    Fiber::yield_now()
}
