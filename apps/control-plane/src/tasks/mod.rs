//! Durable task scheduling over a FIFO queue for ready work and a standard
//! queue for delayed work.

pub mod queue;
pub mod service;
pub mod stats;
pub mod store;
pub mod types;

pub use queue::{QueueAttributes, QueueBackend, QueueError, QueueMessage, SentMessage};
pub use service::{
    TaskError, TaskScheduler, check_not_before, create_task_id, get_delay, task_key,
};
pub use stats::TaskStatisticsCache;
pub use store::{KeyValueStore, StoreError};
pub use types::{
    QueueConfiguration, Task, TaskConfiguration, TaskState, TaskStatistics, TaskStatus,
    TaskStatusUpdate,
};

#[cfg(test)]
mod tests;
