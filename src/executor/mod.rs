// Task-executor core: the multilevel feedback queue and the collaborators a
// worker thread needs to drive it.
//
// - `multilevel_queue`: level organization, selection, charging, blocking take
// - `split`: the split handle trait plus the concrete runner and accounting
// - `thread_pool`: persistent workers pulling quanta from the queue
// - `config` / `counters` / `priority`: knobs, dispatch counters, level math

pub mod config;
pub mod counters;
pub mod multilevel_queue;
pub mod priority;
pub mod split;
pub mod thread_pool;

pub use config::{ExecutorConfig, QueueConfig};
pub use counters::LevelCounter;
pub use multilevel_queue::{Interrupted, MultilevelSplitQueue};
pub use priority::{
    compare_priorities, compute_level, Priority, LEVELS, LEVEL_CONTRIBUTION_CAP_NANOS,
    LEVEL_THRESHOLD_SECONDS,
};
pub use split::{QuantumResult, QueuedSplit, SplitRunner, SplitWork, TaskAccounting};
pub use thread_pool::{RecvError, SplitDone, SplitThreadPool, TryRecvError};
