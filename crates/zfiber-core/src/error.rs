//! Error types shared by the zfiber crates

use core::fmt;

/// Result type for fiber runtime operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors that can occur in runtime, reactor and hook operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// Caller passed an invalid argument (e.g. fd < 0)
    InvalidArgument(&'static str),

    /// Lookup failed and auto-create was not requested
    NotFound,

    /// Operation not legal in the object's current state
    /// (e.g. resume of a terminated fiber)
    IllegalState(&'static str),

    /// The operation requires a current fiber and none is running
    /// on this thread
    NoCurrentFiber,

    /// The task queue has been stopped and drained
    QueueStopped,

    /// A syscall failed; carries the errno value
    Syscall(i32),

    /// A per-operation timeout expired
    Timeout,

    /// The waiter was cancelled before the event fired
    Cancelled,
}

impl FiberError {
    /// Capture the calling thread's errno as a `Syscall` error
    pub fn last_os_error() -> Self {
        FiberError::Syscall(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// The errno value for syscall failures, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            FiberError::Syscall(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            FiberError::NotFound => write!(f, "not found"),
            FiberError::IllegalState(what) => write!(f, "illegal state: {}", what),
            FiberError::NoCurrentFiber => write!(f, "no current fiber on this thread"),
            FiberError::QueueStopped => write!(f, "task queue stopped"),
            FiberError::Syscall(errno) => {
                write!(f, "syscall failed: {}", std::io::Error::from_raw_os_error(*errno))
            }
            FiberError::Timeout => write!(f, "operation timed out"),
            FiberError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for FiberError {}
