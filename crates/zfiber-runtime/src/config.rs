//! Runtime configuration

use crate::stack::DEFAULT_STACK_SIZE;
use zfiber_core::{FiberError, FiberResult};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads
    pub worker_threads: usize,

    /// Name used for thread names and logging
    pub name: String,

    /// Stack size for scheduler fibers and pool-created fibers
    pub stack_size: usize,
}

impl RuntimeConfig {
    pub fn new(worker_threads: usize, name: &str) -> Self {
        Self {
            worker_threads,
            name: name.to_string(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn validate(&self) -> FiberResult<()> {
        if self.worker_threads == 0 {
            return Err(FiberError::InvalidArgument("worker_threads must be > 0"));
        }
        if self.stack_size < crate::stack::MIN_STACK_SIZE {
            return Err(FiberError::InvalidArgument("stack_size below minimum"));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(4, "zfiber")
    }
}
