//! Split handles and per-task runtime accounting.
//!
//! The queue only sees the [`QueuedSplit`] capability set; everything else
//! here is the concrete machinery a worker thread drives. [`TaskAccounting`]
//! is shared by every split of one task and holds the authoritative
//! priority, while each [`SplitRunner`] keeps its own cached copy. The two
//! can drift while a split waits in a level queue, which is exactly the
//! staleness `take` reconciles.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::multilevel_queue::MultilevelSplitQueue;
use super::priority::Priority;

/// Capability set the queue requires of a split handle.
///
/// Handles are externally owned; the queue borrows them through `Arc` and
/// never destroys them.
pub trait QueuedSplit: Send + Sync {
    /// The split's current priority.
    fn priority(&self) -> Priority;

    /// Refresh the split's priority from its runtime accounting.
    ///
    /// Returns `true` iff the refreshed priority lands in a different level
    /// than the one cached before the call, meaning the split aged while it
    /// waited and must be re-enqueued.
    fn update_level_priority(&self) -> bool;

    /// Mark the split admissible for dispatch. Idempotent; invoked by the
    /// queue on every offer.
    fn set_ready(&self);
}

/// Outcome of running a split for one quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantumResult {
    /// The split's work is complete; do not re-offer it.
    Finished,
    /// The split used its quantum and has more work; re-offer it.
    Yielded,
}

// ============================================================================
// Task accounting
// ============================================================================

/// Cumulative scheduled time and authoritative priority for one task.
///
/// Shared by all splits of the task, so a quantum run by any sibling split
/// advances the priority every other split will observe on its next
/// `update_level_priority`.
pub struct TaskAccounting {
    scheduled_nanos: AtomicI64,
    priority: Mutex<Priority>,
}

impl Default for TaskAccounting {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskAccounting {
    /// Fresh accounting, starting in level 0 at priority zero.
    pub fn new() -> Self {
        TaskAccounting {
            scheduled_nanos: AtomicI64::new(0),
            priority: Mutex::new(Priority::new(0, 0)),
        }
    }

    pub fn priority(&self) -> Priority {
        *self.priority.lock()
    }

    pub fn scheduled_nanos(&self) -> i64 {
        self.scheduled_nanos.load(AtomicOrdering::SeqCst)
    }

    /// Charge one quantum to the task and to the queue's level accounting,
    /// installing and returning the new priority.
    pub fn charge<S>(&self, queue: &MultilevelSplitQueue<S>, quanta_nanos: i64) -> Priority
    where
        S: QueuedSplit + ?Sized,
    {
        let scheduled =
            self.scheduled_nanos.fetch_add(quanta_nanos, AtomicOrdering::SeqCst) + quanta_nanos;
        let mut priority = self.priority.lock();
        let updated = queue.update_priority(*priority, quanta_nanos, scheduled);
        *priority = updated;
        updated
    }
}

// ============================================================================
// Split runner
// ============================================================================

/// The work a split performs in one quantum. Receives the quantum budget and
/// reports whether the split finished or merely yielded.
pub type SplitWork = Box<dyn FnMut(Duration) -> QuantumResult + Send>;

/// A runnable split handle.
///
/// Wraps a work closure and the shared task accounting. The cached priority
/// is what the queue orders by; it is refreshed from the accounting after
/// every quantum and by `update_level_priority`.
pub struct SplitRunner {
    accounting: Arc<TaskAccounting>,
    priority: Mutex<Priority>,
    ready: AtomicBool,
    work: Mutex<SplitWork>,
}

impl SplitRunner {
    pub fn new(accounting: Arc<TaskAccounting>, work: SplitWork) -> SplitRunner {
        let priority = accounting.priority();
        SplitRunner {
            accounting,
            priority: Mutex::new(priority),
            ready: AtomicBool::new(false),
            work: Mutex::new(work),
        }
    }

    pub fn accounting(&self) -> &Arc<TaskAccounting> {
        &self.accounting
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(AtomicOrdering::SeqCst)
    }

    /// Run the split for one quantum, measure the elapsed time, and charge
    /// it through the queue.
    pub fn run_quantum(
        &self,
        queue: &MultilevelSplitQueue<SplitRunner>,
        quantum: Duration,
    ) -> QuantumResult {
        let start = Instant::now();
        let result = {
            let mut work = self.work.lock();
            (*work)(quantum)
        };
        let elapsed = start.elapsed().as_nanos() as i64;

        let updated = self.accounting.charge(queue, elapsed);
        *self.priority.lock() = updated;
        trace!(
            elapsed_nanos = elapsed,
            level = updated.level(),
            "quantum charged"
        );
        result
    }
}

impl QueuedSplit for SplitRunner {
    fn priority(&self) -> Priority {
        *self.priority.lock()
    }

    fn update_level_priority(&self) -> bool {
        let new_priority = self.accounting.priority();
        let mut cached = self.priority.lock();
        let changed = new_priority.level() != cached.level();
        *cached = new_priority;
        changed
    }

    fn set_ready(&self) {
        self.ready.store(true, AtomicOrdering::SeqCst);
    }
}
