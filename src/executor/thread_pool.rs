//! Worker pool driving the multilevel split queue.
//!
//! Workers are persistent named threads that block in `take`, run the
//! selected split for one quantum, charge the measured time back to the
//! queue, and re-offer the split if it has work left:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     SplitThreadPool                       │
//! │                                                           │
//! │   submit ──> MultilevelSplitQueue (5 levels)              │
//! │                    │ take        ▲ offer (yielded)        │
//! │        ┌───────────┼─────────────┤                        │
//! │        ▼           ▼             │                        │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐                   │
//! │  │ Worker 1 │ │ Worker 2 │ │ Worker N │                   │
//! │  └──────────┘ └──────────┘ └──────────┘                   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown raises a flag and wakes every blocked worker; an interrupted
//! `take` is the workers' signal to exit.

use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

use super::config::ExecutorConfig;
use super::multilevel_queue::MultilevelSplitQueue;
use super::split::{QuantumResult, SplitRunner, TaskAccounting};

/// A pool of worker threads executing splits in scheduler-chosen order.
pub struct SplitThreadPool {
    queue: Arc<MultilevelSplitQueue<SplitRunner>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    num_threads: usize,
    quantum: Duration,
}

impl SplitThreadPool {
    /// Spawn the configured number of workers, ready for work immediately.
    pub fn new(config: &ExecutorConfig) -> Self {
        let queue = Arc::new(MultilevelSplitQueue::with_config(&config.queue));
        let shutdown = Arc::new(AtomicBool::new(false));
        let quantum = config.quantum();

        let workers: Vec<_> = (0..config.worker_threads)
            .map(|id| {
                let queue = Arc::clone(&queue);
                let shutdown = Arc::clone(&shutdown);
                thread::Builder::new()
                    .name(format!("split-worker-{}", id))
                    .spawn(move || {
                        worker_loop(queue, shutdown, quantum);
                    })
                    .expect("failed to spawn split worker thread")
            })
            .collect();

        debug!(workers = config.worker_threads, "split thread pool started");
        SplitThreadPool {
            queue,
            workers,
            shutdown,
            num_threads: config.worker_threads,
            quantum,
        }
    }

    /// The shared queue, for introspection and direct offers.
    pub fn queue(&self) -> &Arc<MultilevelSplitQueue<SplitRunner>> {
        &self.queue
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Submit a split as its own task.
    ///
    /// `work` is invoked once per quantum with the quantum budget and
    /// reports whether the split finished or yielded. Returns a receiver
    /// that fires when the split retires.
    pub fn submit<F>(&self, work: F) -> SplitDone
    where
        F: FnMut(Duration) -> QuantumResult + Send + 'static,
    {
        self.submit_to_task(Arc::new(TaskAccounting::new()), work)
    }

    /// Submit a split under existing task accounting, so sibling splits
    /// share scheduled time and priority.
    pub fn submit_to_task<F>(&self, accounting: Arc<TaskAccounting>, work: F) -> SplitDone
    where
        F: FnMut(Duration) -> QuantumResult + Send + 'static,
    {
        let (sender, receiver) = bounded(1);
        let mut work = work;
        let split = Arc::new(SplitRunner::new(
            accounting,
            Box::new(move |quantum| {
                let result = work(quantum);
                if result == QuantumResult::Finished {
                    // Ignore send errors, the receiver may have been dropped.
                    let _ = sender.send(());
                }
                result
            }),
        ));

        self.queue.offer(split);
        SplitDone { receiver }
    }

    /// Shut down the pool, waiting for all workers to finish their current
    /// quantum. Splits still waiting in the queue are abandoned.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.notify_waiters();

        for worker in self.workers {
            let _ = worker.join();
        }
        debug!("split thread pool stopped");
    }
}

/// Worker thread main loop.
fn worker_loop(
    queue: Arc<MultilevelSplitQueue<SplitRunner>>,
    shutdown: Arc<AtomicBool>,
    quantum: Duration,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let split = match queue.take(&shutdown) {
            Ok(split) => split,
            // Interrupted by shutdown.
            Err(_) => break,
        };

        match split.run_quantum(&queue, quantum) {
            QuantumResult::Yielded => queue.offer(split),
            QuantumResult::Finished => trace!("split retired"),
        }
    }
}

// ============================================================================
// Completion receiver
// ============================================================================

/// Receiver for a submitted split's completion.
pub struct SplitDone {
    receiver: Receiver<()>,
}

impl SplitDone {
    /// Block until the split retires.
    pub fn recv(self) -> Result<(), RecvError> {
        self.receiver.recv().map_err(|_| RecvError)
    }

    /// Check for completion without blocking.
    pub fn try_recv(&self) -> Result<(), TryRecvError> {
        match self.receiver.try_recv() {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(crossbeam_channel::TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }
}

/// Error returned when the split was dropped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "split was dropped before completing")
    }
}

impl std::error::Error for RecvError {}

/// Error returned when `try_recv` finds no completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// The split has not finished yet.
    Empty,
    /// The split was dropped or the pool shut down.
    Disconnected,
}

impl std::fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "split has not finished yet"),
            TryRecvError::Disconnected => write!(f, "split was dropped or pool shut down"),
        }
    }
}

impl std::error::Error for TryRecvError {}
