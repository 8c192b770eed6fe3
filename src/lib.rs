//! # Crawl Hive
//!
//! Crawl Hive runs crawl scripts on a fixed pool of browser workers: every
//! site becomes a command sequence, a routing key picks the worker(s) that
//! run it, and every step's capture goes to a data sink.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use crawl_hive::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!
//!     // 1. Where captures go and how browsers are started
//!     let sink = Arc::new(JsonlSink::open(&config.manager.data_directory).await?);
//!     let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));
//!
//!     // 2. Start the pool
//!     let manager = TaskManager::launch(config, launcher, sink).await?;
//!
//!     // 3. Visit a site on whichever browser is idle
//!     let sequence = CommandSequence::builder("https://example.org")
//!         .reset(true)
//!         .browse(5, Duration::from_secs(10), Duration::from_secs(360))
//!         .dump_profile_cookies(Duration::from_secs(120))
//!         .build()?;
//!     let result = manager.submit(sequence, RoutingKey::AnyIdle).await?;
//!     println!("{}: {}", result.site, result.overall.as_str());
//!
//!     manager.shutdown(Duration::from_secs(60)).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Crawl Hive consists of:
//! - **Common**: Sequences, routing, configuration, sinks and the browser contract
//! - **Worker**: The worker pool, crash recovery and the Chrome backend
//! - **Dispatcher**: The task manager and the `crawl-hive` binary
//!
//! ## Features
//!
//! - `worker` (default): Include the worker pool
//! - `dispatcher` (default): Include the task manager
//!
//! Use `default-features = false` to include only what you need.

/// Re-export of common types and traits
pub use crawl_hive_common as common;

/// Re-export of worker functionality
#[cfg(feature = "worker")]
pub use crawl_hive_worker as worker;

/// Re-export of dispatch functionality
#[cfg(feature = "dispatcher")]
pub use crawl_hive_dispatcher as dispatcher;

/// Convenient re-exports of commonly used types
pub mod prelude {
    // Sequences and routing
    pub use crate::common::{
        CommandSequence, CommandSequenceBuilder, ExecutionResult, OverallOutcome, RoutingKey,
        Site, StepOutcome, WorkerId,
    };

    // Configuration types
    pub use crate::common::{BrowserParams, EngineConfig, ManagerParams};

    // Sinks
    pub use crate::common::{CaptureRecord, DataSink, JsonlSink, MemorySink};

    // Browser contract
    pub use crate::common::{BrowserLauncher, BrowserSession, Command};

    #[cfg(feature = "worker")]
    pub use crate::worker::{ChromeLauncher, Metrics, WorkerPool};

    #[cfg(feature = "dispatcher")]
    pub use crate::dispatcher::{CancellationToken, SubmitOptions, TaskManager};
}
