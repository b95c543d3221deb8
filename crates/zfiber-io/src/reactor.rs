//! The reactor: one dedicated I/O thread driving poller and timers
//!
//! The reactor owns the poll descriptor, the self-pipe used for
//! wakeups, the timer heap and the fd-context table, and it references
//! the scheduler to enqueue woken work (the scheduler knows nothing
//! about the reactor). Waiting fibers park in fd-context slots; the
//! reactor's loop turns readiness reports and expired timers into
//! scheduler tasks.

use crate::clock;
use crate::fd_context::{EventSet, IoEvent, Waiter};
use crate::fd_table::FdContextTable;
use crate::poller::Poller;
use crate::timer::{Timer, TimerHeap};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use zfiber_core::{FiberError, FiberResult};
use zfiber_runtime::{Fiber, Scheduler};

/// Registration token reserved for the wakeup pipe; no fd can take it
const WAKE_TOKEN: u64 = u64::MAX;

/// Longest single poll; bounds wakeup latency for late-added timers
const POLL_CEILING_MS: u64 = 5000;

/// Worker-thread count of the lazily-created default reactor
const DEFAULT_WORKERS: usize = 4;

/// Shared state between the reactor thread, the workers and the hook
pub(crate) struct ReactorCore {
    name: String,
    scheduler: Arc<Scheduler>,
    poller: Poller,
    timers: TimerHeap,
    fd_table: FdContextTable,
    wake_read: RawFd,
    wake_write: RawFd,
    stopping: AtomicBool,
}

impl ReactorCore {
    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Register interest in one direction of `fd` with an explicit
    /// waiter. Rolls the waiter back out if the poller update fails.
    pub(crate) fn add_event_waiter(
        &self,
        fd: RawFd,
        event: IoEvent,
        waiter: Waiter,
    ) -> FiberResult<()> {
        if fd < 0 {
            return Err(FiberError::InvalidArgument("fd must be >= 0"));
        }
        let ctx = self
            .fd_table
            .get(fd, true)
            .ok_or(FiberError::InvalidArgument("fd must be >= 0"))?;

        let (old, new) = ctx.register(event, waiter);
        // A consumed one-shot waiter leaves the descriptor registered in
        // the kernel (it is only dropped on an explicit removal or on
        // close), so the chosen op can be stale; fall back to the other
        // one instead of failing the re-arm.
        let result = if old.is_empty() {
            match self.poller.add(fd, new, fd as u64) {
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    self.poller.modify(fd, new, fd as u64)
                }
                other => other,
            }
        } else {
            match self.poller.modify(fd, new, fd as u64) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    self.poller.add(fd, new, fd as u64)
                }
                other => other,
            }
        };
        if let Err(e) = result {
            log::error!(
                "reactor[{}] poller update failed: fd={}, event={}, error={}",
                self.name,
                fd,
                event.name(),
                e
            );
            ctx.del_event(event);
            return Err(e);
        }
        log::trace!(
            "reactor[{}] event added: fd={}, event={}, mask={:?}",
            self.name,
            fd,
            event.name(),
            new
        );
        Ok(())
    }

    pub(crate) fn del_event(&self, fd: RawFd, event: IoEvent) -> FiberResult<()> {
        let Some(ctx) = self.fd_table.get(fd, false) else {
            return Ok(());
        };
        if !ctx.events().contains(event.as_set()) {
            return Ok(());
        }
        let remaining = ctx.del_event(event);
        self.update_poller_after_removal(fd, remaining)
    }

    pub(crate) fn cancel_event(&self, fd: RawFd, event: IoEvent) -> FiberResult<()> {
        let Some(ctx) = self.fd_table.get(fd, false) else {
            return Ok(());
        };
        if !ctx.events().contains(event.as_set()) {
            return Ok(());
        }
        let remaining = ctx.cancel_event(event, &self.scheduler);
        self.update_poller_after_removal(fd, remaining)
    }

    pub(crate) fn cancel_all(&self, fd: RawFd) -> FiberResult<()> {
        let Some(ctx) = self.fd_table.get(fd, false) else {
            return Ok(());
        };
        let had = ctx.events();
        ctx.cancel_all(&self.scheduler);
        if !had.is_empty() {
            self.update_poller_after_removal(fd, EventSet::empty())?;
        }
        Ok(())
    }

    fn update_poller_after_removal(&self, fd: RawFd, remaining: EventSet) -> FiberResult<()> {
        let result = if remaining.is_empty() {
            self.poller.remove(fd)
        } else {
            self.poller.modify(fd, remaining, fd as u64)
        };
        match result {
            // The descriptor may already be gone from the kernel set
            // (closed, or never re-armed); that is the desired end state.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => {
                log::error!(
                    "reactor[{}] poller removal failed: fd={}, error={}",
                    self.name,
                    fd,
                    e
                );
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    pub(crate) fn add_timer<F>(&self, timeout_ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let timer = self.timers.add_timer(timeout_ms, callback, recurring);
        self.wake_up();
        timer
    }

    pub(crate) fn add_condition_timer<F, T>(
        &self,
        timeout_ms: u64,
        callback: F,
        witness: &Arc<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let timer = self
            .timers
            .add_condition_timer(timeout_ms, callback, witness, recurring);
        self.wake_up();
        timer
    }

    /// Write one byte to the self-pipe; safe from any thread
    pub(crate) fn wake_up(&self) {
        let ret = unsafe { libc::write(self.wake_write, b"W".as_ptr().cast(), 1) };
        if ret != 1 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // A full pipe already guarantees a pending wakeup.
            if errno != libc::EAGAIN {
                log::error!("reactor[{}] wake_up write failed: errno={}", self.name, errno);
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.wake_read, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for ReactorCore {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// Handle owning the reactor thread
pub struct Reactor {
    core: Arc<ReactorCore>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Reactor {
    /// Build a reactor with its own `worker_threads`-wide scheduler.
    /// `start` must be called before events or timers fire.
    pub fn new(worker_threads: usize, name: &str) -> FiberResult<Arc<Reactor>> {
        let scheduler = Scheduler::new(worker_threads, name);

        let poller = Poller::new()?;
        let mut pipe_fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
        };
        if ret != 0 {
            return Err(FiberError::last_os_error());
        }
        let core = Arc::new(ReactorCore {
            name: name.to_string(),
            scheduler,
            poller,
            timers: TimerHeap::new(),
            fd_table: FdContextTable::new(),
            wake_read: pipe_fds[0],
            wake_write: pipe_fds[1],
            stopping: AtomicBool::new(false),
        });
        core.poller.add(core.wake_read, EventSet::READ, WAKE_TOKEN)?;

        // Workers publish this reactor so the hook layer finds it from
        // inside their fibers.
        let weak = Arc::downgrade(&core);
        core.scheduler.add_thread_start(move || {
            set_thread_core(weak.clone());
        });

        log::info!(
            "reactor[{}] created: workers={}, wake_fd=[{}, {}]",
            name,
            worker_threads,
            pipe_fds[0],
            pipe_fds[1]
        );
        Ok(Arc::new(Reactor {
            core,
            io_thread: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    /// The lazily-created process-wide default reactor, used by the
    /// hook layer when no thread-local reactor is installed. Started on
    /// first access.
    pub fn global() -> &'static Arc<Reactor> {
        static GLOBAL: OnceLock<Arc<Reactor>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let reactor =
                Reactor::new(DEFAULT_WORKERS, "zfiber-io").expect("default reactor creation failed");
            reactor.start();
            reactor
        })
    }

    /// Start the scheduler workers and the reactor thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.scheduler.start();
        let core = self.core.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-reactor", self.core.name))
            .spawn(move || io_loop(core))
            .expect("failed to spawn reactor thread");
        *self.io_thread.lock().unwrap() = Some(handle);
        log::info!("reactor[{}] started", self.core.name);
    }

    /// Stop the reactor thread, then the scheduler. Idempotent.
    pub fn stop(&self) {
        if self.core.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("reactor[{}] stopping", self.core.name);
        self.core.wake_up();
        if let Some(handle) = self.io_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.core.scheduler.stop();
        log::info!("reactor[{}] stopped", self.core.name);
    }

    /// The scheduler this reactor wakes fibers on
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.core.scheduler()
    }

    /// Queue a fiber on the reactor's scheduler
    pub fn schedule(&self, fiber: Arc<Fiber>) {
        self.core.scheduler.schedule(fiber);
    }

    /// Queue a callable on the reactor's scheduler
    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.scheduler.schedule_fn(f);
    }

    /// Register the current fiber as the one-shot waiter for one
    /// direction of `fd`. Must be called from inside a fiber; pair with
    /// `Fiber::yield_now` to suspend until readiness.
    pub fn add_event(&self, fd: RawFd, event: IoEvent) -> FiberResult<()> {
        let fiber = Fiber::current().ok_or(FiberError::NoCurrentFiber)?;
        self.core.add_event_waiter(fd, event, Waiter::Fiber(fiber))
    }

    /// Register a callback as the one-shot waiter for one direction of
    /// `fd`; valid from any thread.
    pub fn add_event_callback<F>(&self, fd: RawFd, event: IoEvent, callback: F) -> FiberResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core
            .add_event_waiter(fd, event, Waiter::Callback(Box::new(callback)))
    }

    /// Remove one direction of interest without waking the waiter
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> FiberResult<()> {
        self.core.del_event(fd, event)
    }

    /// Wake the waiter for one direction, then remove the registration
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> FiberResult<()> {
        self.core.cancel_event(fd, event)
    }

    /// Cancel both directions of `fd`
    pub fn cancel_all(&self, fd: RawFd) -> FiberResult<()> {
        self.core.cancel_all(fd)
    }

    /// Schedule `callback` after `timeout_ms` ms; recurring timers
    /// re-arm with the same interval until cancelled.
    pub fn add_timer<F>(&self, timeout_ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.add_timer(timeout_ms, callback, recurring)
    }

    /// Like `add_timer`, but the timer fires only while `witness` is
    /// alive.
    pub fn add_condition_timer<F, T>(
        &self,
        timeout_ms: u64,
        callback: F,
        witness: &Arc<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.core
            .add_condition_timer(timeout_ms, callback, witness, recurring)
    }

    /// Force the reactor thread out of its poll
    pub fn wake_up(&self) {
        self.core.wake_up();
    }

    pub(crate) fn core(&self) -> &Arc<ReactorCore> {
        &self.core
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

thread_local! {
    /// The reactor owning this worker thread (set at worker start)
    static THREAD_CORE: RefCell<Weak<ReactorCore>> = const { RefCell::new(Weak::new()) };
}

pub(crate) fn set_thread_core(core: Weak<ReactorCore>) {
    THREAD_CORE.with(|c| *c.borrow_mut() = core);
}

/// The reactor the hook layer should talk to from this thread: the
/// owning reactor on worker threads, the global default elsewhere.
pub(crate) fn hook_core() -> Arc<ReactorCore> {
    THREAD_CORE
        .with(|c| c.borrow().upgrade())
        .unwrap_or_else(|| Reactor::global().core().clone())
}

/// The reactor loop, on its dedicated thread
fn io_loop(core: Arc<ReactorCore>) {
    log::info!("reactor[{}] io thread started", core.name);

    while !core.stopping.load(Ordering::Acquire) {
        let timeout = core
            .timers
            .next_timeout_ms()
            .map(|ms| ms.min(POLL_CEILING_MS))
            .unwrap_or(POLL_CEILING_MS) as i32;

        let events = match core.poller.wait(timeout) {
            Ok(events) => events,
            Err(e) => {
                log::error!("reactor[{}] poll failed: {}", core.name, e);
                continue;
            }
        };

        for ev in events {
            if ev.token == WAKE_TOKEN {
                core.drain_wake_pipe();
                continue;
            }
            let fd = ev.token as RawFd;
            let Some(ctx) = core.fd_table.get(fd, false) else {
                continue;
            };
            if ev.events.contains(EventSet::READ) {
                ctx.trigger_event(IoEvent::Read, &core.scheduler);
            }
            if ev.events.contains(EventSet::WRITE) {
                ctx.trigger_event(IoEvent::Write, &core.scheduler);
            }
        }

        let fired = core.timers.drain_expired(clock::now_ms());
        if !fired.is_empty() {
            log::trace!("reactor[{}] firing {} timers", core.name, fired.len());
        }
        for timer in fired {
            core.scheduler.schedule_fn(move || timer.run());
        }
    }

    log::info!("reactor[{}] io thread exiting", core.name);
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
    fn test_timer_fires_on_worker() {
        let reactor = Reactor::new(1, "t_timer").unwrap();
        reactor.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        reactor.add_timer(
            20,
            move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) == 1));
        reactor.stop();
    }

    #[test]
    fn test_recurring_timer_cancel() {
        let reactor = Reactor::new(1, "t_recur").unwrap();
        reactor.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let timer = reactor.add_timer(
            10,
            move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) >= 3));
        timer.cancel();
        let settled = hits.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        // One in-flight fire may land after cancel; no more than that.
        assert!(hits.load(Ordering::SeqCst) <= settled + 1);
        reactor.stop();
    }

    #[test]
    fn test_event_callback_fires_on_readiness() {
        let reactor = Reactor::new(1, "t_event").unwrap();
        reactor.start();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) },
            0
        );
        let (r, w) = (fds[0], fds[1]);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        reactor
            .add_event_callback(r, IoEvent::Read, move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);
        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) == 1));

        reactor.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_cancel_event_wakes_callback() {
        let reactor = Reactor::new(1, "t_cancel").unwrap();
        reactor.start();

        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) },
            0
        );
        let (r, w) = (fds[0], fds[1]);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        reactor
            .add_event_callback(r, IoEvent::Read, move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Nothing was ever written; the cancel is what fires the waiter.
        reactor.cancel_event(r, IoEvent::Read).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        reactor.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let reactor = Reactor::new(1, "t_stop").unwrap();
        reactor.start();
        reactor.stop();
        reactor.stop();
    }
}
