//! splitq - Multilevel Feedback Split Queue
//!
//! This library provides the core dispatch structure of a query-execution
//! task executor: a shared multilevel feedback queue deciding, on every
//! worker thread's next pull, which split runs next. Short, latency-sensitive
//! splits and long-running CPU-heavy ones coexist on one thread pool; new
//! work is preferred so interactive queries stay responsive, while aged work
//! keeps a bounded share of total CPU time.
//!
//! # Architecture
//!
//! Splits are bucketed into five levels by cumulative scheduled time, newest
//! in level 0. Each level orders its waiting splits by a nanosecond level
//! priority, smallest first. In the default time-balanced mode the scheduler
//! targets a geometric scheduled-time distribution across levels (each level
//! aiming for a configurable multiple of the next one's time) and dispatches
//! from the level furthest behind its target; an absolute mode drains lower
//! levels strictly first. After every quantum the consumed time is charged
//! back to the levels, moving splits downward as they age.
//!
//! # Example
//!
//! ```rust
//! use splitq::{ExecutorConfig, QuantumResult, SplitThreadPool};
//!
//! let pool = SplitThreadPool::new(&ExecutorConfig::default());
//!
//! let done = pool.submit(|_quantum| QuantumResult::Finished);
//! done.recv().unwrap();
//!
//! pool.shutdown();
//! ```
//!
//! The queue itself is usable without the pool: implement
//! [`QueuedSplit`] for your own handle type and drive
//! [`MultilevelSplitQueue`] directly from your worker threads.

pub mod executor;

pub use executor::{
    compare_priorities, compute_level, ExecutorConfig, Interrupted, LevelCounter,
    MultilevelSplitQueue, Priority, QuantumResult, QueueConfig, QueuedSplit, RecvError, SplitDone,
    SplitRunner, SplitThreadPool, SplitWork, TaskAccounting, TryRecvError, LEVELS,
    LEVEL_CONTRIBUTION_CAP_NANOS, LEVEL_THRESHOLD_SECONDS,
};
