//! Workers and the pool that owns them.
//!
//! Each worker is a tokio task that owns one browser and runs the command
//! sequences assigned to it strictly one at a time. [`WorkerPool`] keeps the
//! lifecycle state of every worker and the queue of callers waiting for one.

mod chrome;
mod metrics;
mod pool;
mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chrome::{ChromeLauncher, ChromeSession};
pub use metrics::Metrics;
pub use pool::{Admission, Claim, Ticket, WorkerPool};
