//! The M:N scheduler
//!
//! A fixed pool of worker threads drains one shared task queue. Each
//! worker installs the three-level fiber hierarchy for its thread: a
//! main-fiber placeholder capturing the thread's original context, then
//! a scheduler fiber whose entry is the dispatch loop. User fibers
//! always yield back to the scheduler fiber, which picks the next task.
//!
//! This worker-entry sequence is the only code path that installs a
//! thread's main and scheduler fibers.

use crate::config::RuntimeConfig;
use crate::fiber::Fiber;
use crate::pool::FiberPool;
use crate::task::{Task, TaskQueue};
use crate::tls;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type ThreadStartHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Thread-pool scheduler draining the task queue
pub struct Scheduler {
    config: RuntimeConfig,
    queue: Arc<TaskQueue>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,

    /// Extra per-thread setup run at worker start, in registration
    /// order (the reactor publishes itself this way; applications can
    /// enable the syscall hook here)
    thread_start: Mutex<Vec<ThreadStartHook>>,
}

impl Scheduler {
    /// Create a scheduler with `worker_threads` workers.
    ///
    /// # Panics
    ///
    /// Panics on an invalid configuration.
    pub fn new(worker_threads: usize, name: &str) -> Arc<Scheduler> {
        Self::with_config(RuntimeConfig::new(worker_threads, name))
    }

    /// Create a scheduler from a full configuration.
    pub fn with_config(config: RuntimeConfig) -> Arc<Scheduler> {
        config.validate().expect("invalid scheduler configuration");
        log::info!(
            "scheduler[{}] created: worker_threads={}",
            config.name,
            config.worker_threads
        );
        Arc::new(Scheduler {
            config,
            queue: Arc::new(TaskQueue::new()),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            thread_start: Mutex::new(Vec::new()),
        })
    }

    /// Scheduler owning the calling worker thread, if any
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler()
    }

    /// Register a per-worker setup hook. Hooks run in registration
    /// order at the start of every worker thread; register before
    /// `start`.
    pub fn add_thread_start<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.thread_start.lock().unwrap().push(Arc::new(hook));
    }

    /// Spawn the worker threads. Idempotent; a second call is ignored.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("scheduler[{}] already started, skip", self.config.name);
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.config.worker_threads {
            let sched = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", self.config.name, i))
                .spawn(move || worker_main(sched, i))
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
        log::info!(
            "scheduler[{}] started with {} workers",
            self.config.name,
            self.config.worker_threads
        );
    }

    /// Queue a fiber for resumption on some worker.
    ///
    /// Valid from any thread, including inside a fiber. The enqueue
    /// happens-before the fiber's next resume.
    pub fn schedule(&self, fiber: Arc<Fiber>) {
        log::trace!(
            "scheduler[{}] schedule fiber: name={}, id={}",
            self.config.name,
            fiber.name(),
            fiber.id()
        );
        self.queue.push(Task::Fiber(fiber));
    }

    /// Queue a bare callable; the dispatch loop lifts it into a
    /// pool-acquired fiber.
    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Task::Call(Box::new(f)));
    }

    /// Stop the queue, wake every worker and join them. Idempotent.
    /// Tasks already queued are drained before workers exit.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(
            "scheduler[{}] stopping: pending_tasks={}",
            self.config.name,
            self.queue.len()
        );
        self.queue.stop();

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        let me = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == me {
                log::warn!(
                    "scheduler[{}] stop called from a worker; not joining self",
                    self.config.name
                );
                continue;
            }
            let _ = handle.join();
        }
        log::info!("scheduler[{}] stopped", self.config.name);
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configured worker-thread count
    pub fn worker_count(&self) -> usize {
        self.config.worker_threads
    }

    /// Workers currently executing a task
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Workers currently blocked on the queue
    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::Relaxed)
    }

    /// Tasks waiting in the queue
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// The dispatch loop, run inside each worker's scheduler fiber
    fn dispatch_loop(&self) {
        log::debug!("scheduler[{}] dispatch loop started", self.config.name);
        loop {
            self.idle_workers.fetch_add(1, Ordering::Relaxed);
            let task = self.queue.pop();
            self.idle_workers.fetch_sub(1, Ordering::Relaxed);

            let Some(task) = task else {
                // Stopped and drained.
                break;
            };

            self.active_workers.fetch_add(1, Ordering::Relaxed);
            match task {
                Task::Fiber(fiber) => self.run_fiber(fiber),
                Task::Call(f) => {
                    let fiber = FiberPool::global().acquire(f);
                    self.run_fiber(fiber);
                }
            }
            self.active_workers.fetch_sub(1, Ordering::Relaxed);
        }
        log::debug!("scheduler[{}] dispatch loop ended", self.config.name);
    }

    /// Resume one fiber and deal with its outcome. The scheduler never
    /// dies on a fiber failure: panics are logged and swallowed here.
    fn run_fiber(&self, fiber: Arc<Fiber>) {
        match std::panic::catch_unwind(AssertUnwindSafe(|| fiber.resume())) {
            Err(_) => {
                log::error!(
                    "scheduler[{}] fiber panicked: name={}, id={}",
                    self.config.name,
                    fiber.name(),
                    fiber.id()
                );
            }
            Ok(Err(e)) => {
                if fiber.state().can_yield() {
                    // Woken so early that its previous owner is still
                    // switching it out; put it back and let another pop
                    // retry.
                    self.queue.push(Task::Fiber(fiber));
                    return;
                }
                log::warn!(
                    "scheduler[{}] resume failed: name={}, id={}, error={}",
                    self.config.name,
                    fiber.name(),
                    fiber.id(),
                    e
                );
            }
            Ok(Ok(())) => {}
        }

        if fiber.state().is_terminated() {
            FiberPool::global().release(fiber);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker thread body: publish ownership, install the thread's fiber
/// hierarchy, run the scheduler fiber, clean up.
fn worker_main(sched: Arc<Scheduler>, index: usize) {
    tls::set_current_scheduler(Some(sched.clone()));

    let main_fiber = Fiber::main_for_thread();
    tls::set_main_fiber(Some(main_fiber.clone()));
    tls::set_current_fiber(Some(main_fiber));

    let hooks = sched.thread_start.lock().unwrap().clone();
    for hook in hooks {
        hook();
    }

    let loop_sched = sched.clone();
    let scheduler_fiber = Fiber::new(
        move || loop_sched.dispatch_loop(),
        sched.config.stack_size,
        Some("scheduler"),
    );
    tls::set_scheduler_fiber(Some(scheduler_fiber.clone()));

    log::debug!("scheduler[{}] worker {} started", sched.config.name, index);

    if std::panic::catch_unwind(AssertUnwindSafe(|| scheduler_fiber.resume())).is_err() {
        log::error!(
            "scheduler[{}] worker {} scheduler fiber panicked",
            sched.config.name,
            index
        );
    }

    tls::reset();
    log::debug!("scheduler[{}] worker {} exited", sched.config.name, index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(deadline_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        pred()
    }

    #[test]
    fn test_tasks_run_on_workers() {
        let sched = Scheduler::new(2, "test_run");
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = count.clone();
            sched.schedule_fn(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_until(2000, || count.load(Ordering::SeqCst) == 100));
        sched.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_joins() {
        let sched = Scheduler::new(2, "test_stop");
        sched.start();
        sched.stop();
        sched.stop();
        assert!(sched.threads.lock().unwrap().is_empty());
        assert_eq!(sched.idle_workers(), 0);
        assert_eq!(sched.active_workers(), 0);
    }

    #[test]
    fn test_stop_drains_pending_tasks() {
        let sched = Scheduler::new(1, "test_drain");
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            sched.schedule_fn(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Start after queueing so stop races with a full queue.
        sched.start();
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let sched = Scheduler::new(1, "test_panic");
        sched.start();

        sched.schedule_fn(|| panic!("task panic"));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        sched.schedule_fn(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(2000, || ran.load(Ordering::SeqCst) == 1));
        sched.stop();
    }

    #[test]
    fn test_tasks_see_fiber_hierarchy() {
        let sched = Scheduler::new(1, "test_tls");
        sched.start();

        let ok = Arc::new(AtomicUsize::new(0));
        let ok2 = ok.clone();
        sched.schedule_fn(move || {
            let good = tls::is_in_fiber()
                && tls::scheduler_fiber().is_some()
                && tls::main_fiber().is_some()
                && Scheduler::current().is_some();
            if good {
                ok2.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(wait_until(2000, || ok.load(Ordering::SeqCst) == 1));
        sched.stop();
    }

    #[test]
    fn test_yielding_task_completes_after_reschedule() {
        let sched = Scheduler::new(2, "test_yield");
        sched.start();

        let phase = Arc::new(AtomicUsize::new(0));
        let phase2 = phase.clone();
        let sched2 = sched.clone();
        sched.schedule_fn(move || {
            phase2.fetch_add(1, Ordering::SeqCst);
            let me = Fiber::current().expect("inside a fiber");
            // Hand ourselves back to the queue, then suspend; some worker
            // will resume us.
            sched2.schedule(me);
            Fiber::yield_now().unwrap();
            phase2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(2000, || phase.load(Ordering::SeqCst) == 2));
        sched.stop();
    }
}
