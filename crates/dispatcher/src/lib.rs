//! Dispatcher for the worker pool: accepts command sequences with a routing
//! key, waits for workers to be assigned, and aggregates their results.

mod task_manager;

pub use task_manager::{PendingExecution, SubmitOptions, TaskManager};
pub use tokio_util::sync::CancellationToken;
