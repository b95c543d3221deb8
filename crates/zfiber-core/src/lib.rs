//! # zfiber-core
//!
//! Platform-agnostic leaf types for the zfiber coroutine runtime.
//!
//! This crate contains no OS-specific code. Everything that touches
//! syscalls, stacks or thread-locals lives in `zfiber-runtime` and
//! `zfiber-io`.
//!
//! ## Modules
//!
//! - `state` - fiber lifecycle state machine
//! - `id` - fiber identifier allocation
//! - `error` - error taxonomy shared by all zfiber crates
//! - `spinlock` - spinlock for very short critical sections
//! - `semaphore` - thread-level counting semaphore

pub mod error;
pub mod id;
pub mod semaphore;
pub mod spinlock;
pub mod state;

pub use error::{FiberError, FiberResult};
pub use id::FiberId;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use state::FiberState;
