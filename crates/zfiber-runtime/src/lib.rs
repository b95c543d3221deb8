//! # zfiber-runtime
//!
//! The stackful fiber runtime: machine-context switching, fiber stacks,
//! the shared-stack arena, the M:N scheduler and the fiber pool.
//!
//! This crate provides:
//! - Machine context save/restore (architecture-specific assembly)
//! - Stack allocation (mmap with a guard page)
//! - The `Fiber` type: resume / yield / reset with panic capture
//! - A shared-stack arena for memory-dense fiber populations
//! - A worker-thread scheduler draining a FIFO task queue
//! - A pool recycling terminated fibers

pub mod arch;
pub mod config;
pub mod ctx;
pub mod fiber;
pub mod pool;
pub mod scheduler;
pub mod shared_stack;
pub mod stack;
pub mod task;
pub mod tls;

pub use config::RuntimeConfig;
pub use ctx::MachineContext;
pub use fiber::Fiber;
pub use pool::{FiberPool, PoolStatistics};
pub use scheduler::Scheduler;
pub use shared_stack::SharedStackArena;
pub use stack::{OwnedStack, DEFAULT_STACK_SIZE};
pub use task::{Task, TaskQueue};

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("zfiber-runtime only supports Linux");
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("zfiber-runtime only supports x86_64 and aarch64");
    }
}
