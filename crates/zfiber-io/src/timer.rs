//! Timers and the timer heap
//!
//! Timers carry an absolute deadline on the monotonic clock, an
//! interval, a recurring flag, a cancelled flag and an optional weak
//! liveness witness. The heap orders them by (deadline, sequence) under
//! a single mutex. Cancellation is lazy: a cancelled timer stays in the
//! heap until its deadline passes and is skipped when drained.

use crate::clock;
use std::any::Any;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;
type WitnessRef = Weak<dyn Any + Send + Sync + 'static>;

/// A scheduled callback
pub struct Timer {
    /// Absolute deadline, ms on the monotonic epoch
    deadline_ms: AtomicU64,

    /// Interval used to re-arm recurring timers (and `refresh`)
    interval_ms: AtomicU64,

    recurring: bool,
    cancelled: AtomicBool,

    /// Cleared on cancel so captured state is released promptly
    callback: Mutex<Option<TimerCallback>>,

    /// When present, the timer only fires while the witness is alive
    witness: Option<WitnessRef>,
}

impl Timer {
    fn new(
        timeout_ms: u64,
        callback: TimerCallback,
        recurring: bool,
        witness: Option<WitnessRef>,
    ) -> Arc<Timer> {
        Arc::new(Timer {
            deadline_ms: AtomicU64::new(clock::now_ms() + timeout_ms),
            interval_ms: AtomicU64::new(timeout_ms),
            recurring,
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
            witness,
        })
    }

    /// Absolute deadline in ms
    #[inline]
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms.load(Ordering::Acquire)
    }

    /// Interval in ms
    #[inline]
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark cancelled and drop the callback. A cancelled timer is
    /// silently skipped when the reactor dequeues it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        *self.callback.lock().unwrap() = None;
        log::trace!("timer cancelled: interval={}ms", self.interval_ms());
    }

    /// Re-arm from now with the current interval. Takes effect at the
    /// next (re)insert.
    pub fn refresh(&self) {
        self.deadline_ms
            .store(clock::now_ms() + self.interval_ms(), Ordering::Release);
    }

    /// Change the interval and re-arm from now
    pub fn reset_interval(&self, interval_ms: u64) {
        self.interval_ms.store(interval_ms, Ordering::Release);
        self.deadline_ms
            .store(clock::now_ms() + interval_ms, Ordering::Release);
    }

    /// True unless a witness was attached and has since died
    pub fn is_live(&self) -> bool {
        match &self.witness {
            Some(w) => w.strong_count() > 0,
            None => true,
        }
    }

    /// Run the callback unless cancelled. The callback is cloned out of
    /// the lock first, so it may freely cancel or re-arm this timer.
    pub fn run(&self) {
        if self.is_cancelled() {
            return;
        }
        let cb = self.callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Advance the deadline by one interval (recurring re-insert)
    fn advance(&self) {
        self.deadline_ms
            .fetch_add(self.interval_ms(), Ordering::AcqRel);
    }
}

/// Heap entry: deadline snapshot plus an insertion sequence tiebreaker
struct HeapEntry {
    deadline: u64,
    seq: u64,
    timer: Arc<Timer>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest
        // deadline on top. Sequence keeps ties deterministic.
        match other.deadline.cmp(&self.deadline) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Deadline-ordered set of timers, guarded by a single mutex
pub struct TimerHeap {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    seq: AtomicU64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Create and insert a timer firing `callback` after `timeout_ms`,
    /// and every `timeout_ms` thereafter when `recurring`.
    pub fn add_timer<F>(&self, timeout_ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let timer = Timer::new(timeout_ms, Arc::new(callback), recurring, None);
        self.insert(timer.clone());
        log::trace!(
            "timer added: timeout={}ms, recurring={}, total={}",
            timeout_ms,
            recurring,
            self.len()
        );
        timer
    }

    /// Like `add_timer`, but the timer only fires while `witness` is
    /// still alive; once the witness dies the timer is skipped and, for
    /// recurring timers, not re-armed.
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
        let weak: WitnessRef = Arc::downgrade(&(witness.clone() as Arc<dyn Any + Send + Sync>));
        let timer = Timer::new(timeout_ms, Arc::new(callback), recurring, Some(weak));
        self.insert(timer.clone());
        timer
    }

    fn insert(&self, timer: Arc<Timer>) {
        let entry = HeapEntry {
            deadline: timer.deadline_ms(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timer,
        };
        self.heap.lock().unwrap().push(entry);
    }

    /// Earliest deadline among present timers (cancelled ones included;
    /// they drain on schedule and cost one spurious wakeup at worst)
    pub fn peek_deadline(&self) -> Option<u64> {
        self.heap.lock().unwrap().peek().map(|e| e.deadline)
    }

    /// Milliseconds until the next deadline: `None` with no timers,
    /// 0 when one is already overdue
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let deadline = self.peek_deadline()?;
        Some(deadline.saturating_sub(clock::now_ms()))
    }

    /// Remove every timer with `deadline <= now` and return the ones
    /// that should fire. Cancelled or witness-dead timers are dropped;
    /// recurring survivors are re-inserted with `deadline += interval`.
    pub fn drain_expired(&self, now_ms: u64) -> Vec<Arc<Timer>> {
        let mut fired = Vec::new();
        let mut requeue = Vec::new();

        let mut heap = self.heap.lock().unwrap();
        while let Some(entry) = heap.peek() {
            if entry.deadline > now_ms {
                break;
            }
            let entry = heap.pop().unwrap();
            let timer = entry.timer;

            if timer.is_cancelled() || !timer.is_live() {
                continue;
            }

            if timer.is_recurring() {
                timer.advance();
                requeue.push(timer.clone());
            }
            fired.push(timer);
        }
        let base_seq = self.seq.fetch_add(requeue.len() as u64, Ordering::Relaxed);
        for (i, timer) in requeue.into_iter().enumerate() {
            heap.push(HeapEntry {
                deadline: timer.deadline_ms(),
                seq: base_seq + i as u64,
                timer,
            });
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}
