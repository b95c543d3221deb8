//! Tasks and the runnable queue
//!
//! A task is either a fiber to resume or a bare callable; callables are
//! lifted into pool-acquired fibers by the dispatch loop. The queue is a
//! FIFO guarded by one mutex and a condvar. Stopping the queue still
//! accepts pushes and keeps handing out queued tasks until the queue is
//! drained; only then does `pop` fail.

use crate::fiber::Fiber;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// A unit of runnable work
pub enum Task {
    /// Resume this fiber
    Fiber(Arc<Fiber>),

    /// Run this callable inside a pool-acquired fiber
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Fiber(_) => "fiber",
            Task::Call(_) => "call",
        }
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

struct QueueInner {
    tasks: VecDeque<Task>,
    stopped: bool,
}

/// MPMC FIFO of tasks with stop-and-drain semantics
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append a task and wake one blocked consumer. Always succeeds,
    /// even after `stop` (late pushes participate in the drain).
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.push_back(task);
        drop(inner);
        self.cond.notify_one();
    }

    /// Block until a task is available; `None` once the queue is stopped
    /// and empty.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(task) = inner.tasks.pop_front() {
                return Some(task);
            }
            if inner.stopped {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<Task> {
        self.inner.lock().unwrap().tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().tasks.is_empty()
    }

    /// Mark the queue stopped and wake every blocked consumer
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.stopped = true;
        }
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
