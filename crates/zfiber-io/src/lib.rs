//! # zfiber-io
//!
//! The I/O half of the zfiber runtime: an edge-triggered epoll reactor
//! with a timer heap, per-descriptor event state machines, and the
//! libc-interposition layer that turns ordinary blocking socket calls
//! into cooperative suspension points.
//!
//! This crate provides:
//! - A monotonic millisecond clock shared by every timer
//! - `Timer` / `TimerHeap`: deadline-ordered timers with lazy
//!   cancellation, recurrence and weak liveness witnesses
//! - `Poller`: a thin edge-triggered epoll wrapper
//! - `FdContext` / `FdContextTable`: per-fd read/write waiter slots
//! - `FdMetadata` / `FdMetaTable`: per-fd socket flags and timeouts
//! - `Reactor`: the dedicated I/O thread tying it all together
//! - The syscall hook: `#[no_mangle]` wrappers over `dlsym(RTLD_NEXT)`
//!   originals for the blocking libc subset

pub mod clock;
pub mod fd_context;
pub mod fd_meta;
pub mod fd_table;
pub mod hook;
pub mod poller;
pub mod reactor;
pub mod timer;

pub use fd_context::{EventSet, FdContext, IoEvent, Waiter};
pub use fd_meta::{FdMetaTable, FdMetadata, TimeoutKind};
pub use fd_table::FdContextTable;
pub use hook::{is_hook_enabled, set_connect_timeout_ms, set_hook_enabled};
pub use poller::{PollEvent, Poller};
pub use reactor::Reactor;
pub use timer::{Timer, TimerHeap};
