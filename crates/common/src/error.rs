use crate::types::WorkerId;
use std::time::Duration;
use thiserror::Error;

/// A command sequence was malformed; rejected before any worker sees it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("command sequence for '{site}' has no steps")]
    EmptySequence { site: String },

    #[error("step {step_index} ({description}) of '{site}' has a zero timeout")]
    ZeroTimeout {
        site: String,
        step_index: usize,
        description: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("{0} has crashed and could not be relaunched")]
    WorkerCrashed(WorkerId),

    #[error("no idle worker available")]
    NoIdleWorker,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid command sequence: {0}")]
    InvalidSequence(#[from] SequenceError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("worker pool exhausted - every worker has crashed")]
    PoolExhausted,

    #[error("{0} is busy")]
    WorkerBusy(WorkerId),

    #[error("no worker became available within {0:?}")]
    WaitTimedOut(Duration),

    #[error("submission cancelled before assignment")]
    Cancelled,

    #[error("task manager is shutting down")]
    ShuttingDown,

    #[error("broadcast submissions produce one result per worker - use execute()")]
    BroadcastNotSingle,

    #[error("{0} stopped before reporting a result")]
    WorkerLost(WorkerId),
}

/// Failure of a single step while driving the browser
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser error: {0}")]
    Browser(String),

    /// The browser process is gone; the worker must relaunch it
    #[error("browser process is gone: {0}")]
    BrowserGone(String),

    #[error("instrumentation failed: {0}")]
    Instrumentation(String),

    /// The step panicked; the browser is left in an unknown state
    #[error("step panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::BrowserGone(_) | StepError::Panicked(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to launch browser for {worker_id}: {reason}")]
pub struct LaunchError {
    pub worker_id: WorkerId,
    pub reason: String,
}

impl LaunchError {
    pub fn new(worker_id: WorkerId, reason: impl Into<String>) -> Self {
        Self {
            worker_id,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize capture: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink is closed")]
    Closed,
}
