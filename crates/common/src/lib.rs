pub mod browser;
pub mod command;
pub mod config;
pub mod error;
pub mod router;
pub mod sink;
pub mod types;
pub mod utils;

pub use browser::{
    BrowserLauncher, BrowserSession, CookieRecord, HttpRequestRecord, PageVisit, ProfileMode,
};
pub use command::{
    BrowseCommand, Command, CommandSequence, CommandSequenceBuilder, DumpCookiesCommand,
    GetCommand,
};
pub use config::*;
pub use error::*;
pub use sink::{append_with_retry, CaptureRecord, DataSink, JsonlSink, MemorySink};
pub use types::*;
