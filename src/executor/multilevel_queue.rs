//! Multilevel feedback queue for split dispatch.
//!
//! This module provides the shared queue a task executor's worker threads
//! pull from. Splits are bucketed into levels by cumulative scheduled time,
//! newest work in level 0, and each level keeps its waiting splits in a
//! min-heap ordered by level priority.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards the level heaps and the per-level
//!   scheduled-time accounting; one `Condvar` wakes a single waiter per
//!   offer.
//! - Per-level minimum priorities and dispatch counters are atomics outside
//!   the lock.
//! - Selection runs in one of two modes: absolute (drain lower levels
//!   first) or time-balanced (pick the level furthest behind a geometric
//!   scheduled-time target, adjacent levels separated by a configurable
//!   multiplier).
//! - A split's priority can go stale while it waits: the heap entry keeps
//!   the priority it was inserted with, and `take` reconciles by re-offering
//!   any split whose level changed in the meantime.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::trace;

use super::config::QueueConfig;
use super::counters::LevelCounter;
use super::priority::{
    compute_level, level_width_nanos, Priority, LEVELS, LEVEL_CONTRIBUTION_CAP_NANOS,
};
use super::split::QueuedSplit;

// ============================================================================
// Heap entries
// ============================================================================

/// A waiting split plus the priority snapshot it was enqueued under.
///
/// The snapshot keeps the heap order stable even if the split's own priority
/// moves while it waits; `take` re-checks against the live priority before
/// handing the split out.
struct QueueEntry<S: QueuedSplit + ?Sized> {
    split: Arc<S>,
    level_priority: i64,
    sequence: u64,
}

impl<S: QueuedSplit + ?Sized> Ord for QueueEntry<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-extraction from BinaryHeap, then FIFO on the
        // insertion sequence for equal priorities.
        other
            .level_priority
            .cmp(&self.level_priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl<S: QueuedSplit + ?Sized> PartialOrd for QueueEntry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S: QueuedSplit + ?Sized> Eq for QueueEntry<S> {}

impl<S: QueuedSplit + ?Sized> PartialEq for QueueEntry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.level_priority == other.level_priority && self.sequence == other.sequence
    }
}

// ============================================================================
// Locked state
// ============================================================================

struct LevelState<S: QueuedSplit + ?Sized> {
    /// Waiting splits per level, min `level_priority` first.
    waiting: [BinaryHeap<QueueEntry<S>>; LEVELS],

    /// Cumulative scheduled time charged to each level (nanoseconds).
    /// Raised, never lowered, except when the starvation adjustment snaps an
    /// empty level up to its expected value.
    scheduled_nanos: [i64; LEVELS],
}

// ============================================================================
// Interruption
// ============================================================================

/// Error returned when a blocked `take` was asked to abort.
///
/// This is not a failure of the queue; retrying is safe and no state was
/// mutated on behalf of the interrupted caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted while waiting for a split")
    }
}

impl std::error::Error for Interrupted {}

// ============================================================================
// MultilevelSplitQueue
// ============================================================================

/// The shared multilevel feedback queue.
///
/// Worker threads call [`take`](MultilevelSplitQueue::take) to block until
/// the scheduler picks a split, run it for a quantum, charge the consumed
/// time back through [`update_priority`](MultilevelSplitQueue::update_priority),
/// and either re-[`offer`](MultilevelSplitQueue::offer) or retire it.
///
/// `S` is the externally owned split handle type; the queue borrows handles
/// via `Arc` and never destroys them.
pub struct MultilevelSplitQueue<S: QueuedSplit + ?Sized> {
    state: Mutex<LevelState<S>>,
    not_empty: Condvar,

    /// Level priority of the most recently dispatched split per level, the
    /// floor for splits newly promoted into that level. -1 means the level
    /// has not dispatched yet; the first reader seeds it.
    min_priority: [AtomicI64; LEVELS],

    selected_level_counters: [LevelCounter; LEVELS],

    level_absolute_priority: bool,
    level_time_multiplier: f64,

    /// Monotone insertion sequence for deterministic heap tie-breaking.
    sequence: AtomicU64,
}

impl<S: QueuedSplit + ?Sized> MultilevelSplitQueue<S> {
    /// Create a queue.
    ///
    /// `level_absolute_priority` selects strict lower-level-first draining
    /// instead of the default time-balanced selection.
    /// `level_time_multiplier` is the target scheduled-time ratio between
    /// adjacent levels; values at or below 1.0 degenerate the selection and
    /// are not validated here.
    pub fn new(level_absolute_priority: bool, level_time_multiplier: f64) -> Self {
        MultilevelSplitQueue {
            state: Mutex::new(LevelState {
                waiting: std::array::from_fn(|_| BinaryHeap::new()),
                scheduled_nanos: [0; LEVELS],
            }),
            not_empty: Condvar::new(),
            min_priority: std::array::from_fn(|_| AtomicI64::new(-1)),
            selected_level_counters: std::array::from_fn(|_| LevelCounter::new()),
            level_absolute_priority,
            level_time_multiplier,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_config(config: &QueueConfig) -> Self {
        Self::new(config.level_absolute_priority, config.level_time_multiplier)
    }

    /// Make a ready split eligible for dispatch.
    ///
    /// The split is marked ready, inserted into the level named by its
    /// current priority, and one waiter is woken. Each offer makes at most
    /// one split available, so a single wakeup suffices.
    pub fn offer(&self, split: Arc<S>) {
        split.set_ready();
        let priority = split.priority();

        let mut state = self.state.lock();
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(
            level = priority.level(),
            level_priority = priority.level_priority(),
            "split offered"
        );
        state.waiting[priority.level()].push(QueueEntry {
            split,
            level_priority: priority.level_priority(),
            sequence,
        });
        self.not_empty.notify_one();
    }

    /// Block until the scheduler chooses a split, then return it.
    ///
    /// The returned split's level counter has been incremented and the
    /// level's minimum priority updated to the split's level priority. A
    /// split whose level changed while it waited is re-offered into its
    /// current level and the selection restarts, so the returned level
    /// always reflects the split's cumulative runtime.
    ///
    /// `interrupt` is checked around every wait; setting it and calling
    /// [`notify_waiters`](MultilevelSplitQueue::notify_waiters) aborts the
    /// call with [`Interrupted`]. Spurious wakeups re-check and go back to
    /// sleep.
    pub fn take(&self, interrupt: &AtomicBool) -> Result<Arc<S>, Interrupted> {
        loop {
            let mut state = self.state.lock();
            let split = loop {
                if interrupt.load(AtomicOrdering::SeqCst) {
                    return Err(Interrupted);
                }
                match self.poll_split(&mut state) {
                    Some(split) => break split,
                    None => self.not_empty.wait(&mut state),
                }
            };
            drop(state);

            if split.update_level_priority() {
                // Aged into a different level while waiting; requeue under
                // its current priority and select again.
                self.offer(split);
                continue;
            }

            let priority = split.priority();
            self.min_priority[priority.level()]
                .store(priority.level_priority(), AtomicOrdering::SeqCst);
            self.selected_level_counters[priority.level()].increment();
            trace!(
                level = priority.level(),
                level_priority = priority.level_priority(),
                "split dispatched"
            );
            return Ok(split);
        }
    }

    /// Pick the next split under the lock, or `None` when every level is
    /// empty.
    fn poll_split(&self, state: &mut LevelState<S>) -> Option<Arc<S>> {
        if self.level_absolute_priority {
            for level in state.waiting.iter_mut() {
                if let Some(entry) = level.pop() {
                    return Some(entry.split);
                }
            }
            return None;
        }

        let mut target_scheduled_time = self.update_level_times(state);
        let mut worst_ratio = 1.0_f64;
        let mut selected_level: Option<usize> = None;

        for level in 0..LEVELS {
            if !state.waiting[level].is_empty() {
                let level_time = state.scheduled_nanos[level];
                // A ratio above 1 means the level is behind its target. A
                // level that has never run gets ratio 0 rather than infinity;
                // the starvation adjustment is what protects it.
                let ratio = if level_time == 0 {
                    0.0
                } else {
                    target_scheduled_time as f64 / level_time as f64
                };

                if selected_level.is_none() || ratio > worst_ratio {
                    worst_ratio = ratio;
                    selected_level = Some(level);
                }
            }
            // The next level's target is this one's divided by the
            // multiplier. Level 0's own target is exactly the anchor
            // returned by update_level_times.
            target_scheduled_time =
                (target_scheduled_time as f64 / self.level_time_multiplier) as i64;
        }

        let selected = selected_level?;
        let entry = state.waiting[selected]
            .pop()
            .expect("selected level has no waiting splits");
        Some(entry.split)
    }

    /// Derive the level-0 scheduled-time target and snap empty levels up to
    /// their expected share.
    ///
    /// A level with no waiting splits stops accruing scheduled time and
    /// falls behind the others; when work finally reaches it, its ratio
    /// would dominate selection for an unbounded burst. Raising an empty
    /// level's scheduled time to the expected value derived from the anchor
    /// removes that advantage. The anchor itself is raised until no
    /// non-empty level sits above its expected time, so the adjustment only
    /// ever increases scheduled times.
    fn update_level_times(&self, state: &mut LevelState<S>) -> i64 {
        let mut level0_target_time = state.scheduled_nanos[0];

        loop {
            let mut updated = false;
            let mut current_multiplier = self.level_time_multiplier;

            for level in 0..LEVELS {
                current_multiplier /= self.level_time_multiplier;
                let level_time = state.scheduled_nanos[level];
                let level_expected_time = (level0_target_time as f64 * current_multiplier) as i64;

                if state.waiting[level].is_empty() {
                    state.scheduled_nanos[level] = level_expected_time;
                    continue;
                }

                if level_time > level_expected_time {
                    level0_target_time = (level_time as f64 / current_multiplier) as i64;
                    updated = true;
                    break;
                }
            }

            if !updated || level0_target_time == 0 {
                return level0_target_time;
            }
        }
    }

    /// Charge one quantum of consumed time and compute the split's next
    /// priority.
    ///
    /// `quanta_nanos` is the time consumed in the quantum just finished and
    /// `scheduled_nanos` the split's cumulative scheduled time including it.
    /// The contribution to level accounting is capped at
    /// [`LEVEL_CONTRIBUTION_CAP_NANOS`]; the within-level priority always
    /// advances by the uncapped quantum so intra-level order tracks true
    /// consumption.
    pub fn update_priority(
        &self,
        old_priority: Priority,
        quanta_nanos: i64,
        scheduled_nanos: i64,
    ) -> Priority {
        let old_level = old_priority.level();
        let new_level = compute_level(scheduled_nanos);
        let level_contribution = quanta_nanos.min(LEVEL_CONTRIBUTION_CAP_NANOS);

        if old_level == new_level {
            self.add_level_time(old_level, level_contribution);
            return Priority::new(old_level, old_priority.level_priority() + quanta_nanos);
        }

        // The split leapt at least one level in a single quantum. Accrue
        // time to each traversed level as if the split had run there for
        // that level's width, then give the new level whatever the cap left
        // over.
        let mut remaining_level_contribution = level_contribution;
        let mut remaining_task_time = quanta_nanos;
        {
            let mut state = self.state.lock();
            for level in old_level..new_level {
                let accrued = level_width_nanos(level).min(remaining_level_contribution);
                state.scheduled_nanos[level] += accrued;
                remaining_level_contribution -= accrued;
                remaining_task_time -= accrued;
            }
            state.scheduled_nanos[new_level] += remaining_level_contribution;
        }
        trace!(old_level, new_level, "split changed level");

        // Enter the new level at the floor of its in-flight work instead of
        // carrying the old level's inflated scalar.
        let new_level_min_priority = self.level_min_priority(new_level, scheduled_nanos);
        Priority::new(new_level, new_level_min_priority + remaining_task_time)
    }

    /// Minimum priority floor for a level, seeding the sentinel from the
    /// caller's scheduled time on first read.
    pub fn level_min_priority(&self, level: usize, scheduled_nanos: i64) -> i64 {
        let _ = self.min_priority[level].compare_exchange(
            -1,
            scheduled_nanos,
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
        );
        self.min_priority[level].load(AtomicOrdering::SeqCst)
    }

    fn add_level_time(&self, level: usize, nanos: i64) {
        let mut state = self.state.lock();
        state.scheduled_nanos[level] += nanos;
    }

    /// Withdraw a split wherever it waits. Callers may not know the current
    /// level, so every level is scanned; removing an absent split is a
    /// silent no-op.
    pub fn remove(&self, split: &Arc<S>) {
        let mut state = self.state.lock();
        for level in state.waiting.iter_mut() {
            level.retain(|entry| !Arc::ptr_eq(&entry.split, split));
        }
    }

    /// Withdraw a batch of splits. Idempotent like [`remove`](Self::remove).
    pub fn remove_all<'a, I>(&self, splits: I)
    where
        I: IntoIterator<Item = &'a Arc<S>>,
        S: 'a,
    {
        let mut state = self.state.lock();
        for split in splits {
            for level in state.waiting.iter_mut() {
                level.retain(|entry| !Arc::ptr_eq(&entry.split, split));
            }
        }
    }

    /// Total waiting splits across all levels.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.waiting.iter().map(|level| level.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-level dispatch counters. Monotone; the queue never resets them.
    pub fn selected_level_counters(&self) -> &[LevelCounter; LEVELS] {
        &self.selected_level_counters
    }

    /// Snapshot of the per-level scheduled time, for tests and metrics.
    pub fn level_scheduled_time(&self) -> [i64; LEVELS] {
        self.state.lock().scheduled_nanos
    }

    /// Wake every blocked `take`, typically after raising an interrupt flag.
    pub fn notify_waiters(&self) {
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::priority::NANOS_PER_SECOND;
    use parking_lot::Mutex;

    struct TestSplit {
        priority: Mutex<Priority>,
        ready: AtomicBool,
    }

    impl TestSplit {
        fn at(level: usize, level_priority: i64) -> Arc<TestSplit> {
            Arc::new(TestSplit {
                priority: Mutex::new(Priority::new(level, level_priority)),
                ready: AtomicBool::new(false),
            })
        }
    }

    impl QueuedSplit for TestSplit {
        fn priority(&self) -> Priority {
            *self.priority.lock()
        }

        fn update_level_priority(&self) -> bool {
            false
        }

        fn set_ready(&self) {
            self.ready.store(true, AtomicOrdering::SeqCst);
        }
    }

    fn no_interrupt() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_absolute_mode_drains_lower_levels_first() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(true, 2.0);
        let interrupt = no_interrupt();

        queue.offer(TestSplit::at(2, 0));
        queue.offer(TestSplit::at(0, 0));
        queue.offer(TestSplit::at(1, 0));

        assert_eq!(queue.take(&interrupt).unwrap().priority().level(), 0);
        assert_eq!(queue.take(&interrupt).unwrap().priority().level(), 1);
        assert_eq!(queue.take(&interrupt).unwrap().priority().level(), 2);
    }

    #[test]
    fn test_within_level_min_priority_first() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(true, 2.0);
        let interrupt = no_interrupt();

        queue.offer(TestSplit::at(0, 30));
        queue.offer(TestSplit::at(0, 10));
        queue.offer(TestSplit::at(0, 20));

        let order: Vec<i64> = (0..3)
            .map(|_| queue.take(&interrupt).unwrap().priority().level_priority())
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn test_equal_priorities_dispatch_fifo() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(true, 2.0);
        let interrupt = no_interrupt();

        let first = TestSplit::at(0, 7);
        let second = TestSplit::at(0, 7);
        queue.offer(Arc::clone(&first));
        queue.offer(Arc::clone(&second));

        let taken = queue.take(&interrupt).unwrap();
        assert!(Arc::ptr_eq(&taken, &first));
        let taken = queue.take(&interrupt).unwrap();
        assert!(Arc::ptr_eq(&taken, &second));
    }

    #[test]
    fn test_take_updates_counter_and_min_priority() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(true, 2.0);
        let interrupt = no_interrupt();

        queue.offer(TestSplit::at(1, 55));
        let split = queue.take(&interrupt).unwrap();
        assert_eq!(split.priority().level(), 1);
        assert_eq!(queue.selected_level_counters()[1].total(), 1);
        assert_eq!(queue.level_min_priority(1, 0), 55);
    }

    #[test]
    fn test_update_priority_same_level() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(false, 2.0);

        let updated = queue.update_priority(Priority::new(0, 100), 200, 300);
        assert_eq!(updated.level(), 0);
        assert_eq!(updated.level_priority(), 300);
        assert_eq!(queue.level_scheduled_time()[0], 200);
    }

    #[test]
    fn test_update_priority_caps_level_charge() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(false, 2.0);

        // Already in the deepest level, so the whole quantum stays there.
        let quanta = 60 * NANOS_PER_SECOND;
        let scheduled = 400 * NANOS_PER_SECOND;
        let updated = queue.update_priority(Priority::new(4, 0), quanta, scheduled);

        assert_eq!(updated.level(), 4);
        assert_eq!(updated.level_priority(), quanta);
        assert_eq!(queue.level_scheduled_time()[4], 30 * NANOS_PER_SECOND);
    }

    #[test]
    fn test_update_priority_distributes_across_levels() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(false, 2.0);

        let quanta = 20 * NANOS_PER_SECOND;
        let updated = queue.update_priority(Priority::new(0, 0), quanta, quanta);

        assert_eq!(updated.level(), 2);
        let scheduled = queue.level_scheduled_time();
        assert_eq!(scheduled[0], NANOS_PER_SECOND);
        assert_eq!(scheduled[1], 9 * NANOS_PER_SECOND);
        assert_eq!(scheduled[2], 10 * NANOS_PER_SECOND);
        assert_eq!(scheduled[3], 0);

        // Min priority was seeded from the split's scheduled time, and the
        // time not accounted to traversed levels lands on top of it.
        assert_eq!(
            updated.level_priority(),
            quanta + 10 * NANOS_PER_SECOND
        );
    }

    #[test]
    fn test_charge_conservation_under_cap() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(false, 2.0);

        let quanta = 60 * NANOS_PER_SECOND;
        let before: i64 = queue.level_scheduled_time().iter().sum();
        queue.update_priority(Priority::new(0, 0), quanta, quanta);
        let after: i64 = queue.level_scheduled_time().iter().sum();

        assert_eq!(after - before, LEVEL_CONTRIBUTION_CAP_NANOS);
    }

    #[test]
    fn test_level_min_priority_seeds_once() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(false, 2.0);

        assert_eq!(queue.level_min_priority(3, 42), 42);
        assert_eq!(queue.level_min_priority(3, 99), 42);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(true, 2.0);

        let kept = TestSplit::at(0, 1);
        let removed = TestSplit::at(0, 2);
        queue.offer(Arc::clone(&kept));
        queue.offer(Arc::clone(&removed));
        assert_eq!(queue.len(), 2);

        queue.remove(&removed);
        queue.remove(&removed);
        assert_eq!(queue.len(), 1);

        let interrupt = no_interrupt();
        let taken = queue.take(&interrupt).unwrap();
        assert!(Arc::ptr_eq(&taken, &kept));
    }

    #[test]
    fn test_remove_all() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(true, 2.0);

        let splits = [TestSplit::at(0, 1), TestSplit::at(2, 1), TestSplit::at(4, 1)];
        for split in &splits {
            queue.offer(Arc::clone(split));
        }
        assert_eq!(queue.len(), 3);

        queue.remove_all(splits.iter());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_interrupted() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(false, 2.0);
        let interrupt = AtomicBool::new(true);

        assert!(matches!(queue.take(&interrupt), Err(Interrupted)));
    }

    #[test]
    fn test_never_run_level_is_not_starved_and_not_favored() {
        let queue: MultilevelSplitQueue<TestSplit> = MultilevelSplitQueue::new(false, 2.0);
        let interrupt = no_interrupt();

        // Fresh queue, work only in level 2. The anchor is zero, so nothing
        // is snapped and the split dispatches immediately.
        queue.offer(TestSplit::at(2, 0));
        let split = queue.take(&interrupt).unwrap();
        assert_eq!(split.priority().level(), 2);
        assert_eq!(queue.level_scheduled_time(), [0; LEVELS]);
    }
}
