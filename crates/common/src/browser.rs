//! Capability contract between the engine and a browser process.
//!
//! The engine never looks inside a browser. A worker owns exactly one
//! [`BrowserSession`] obtained from a [`BrowserLauncher`], drives it through
//! commands, and terminates it when the worker is recovered or shut down.

use crate::error::{LaunchError, StepError};
use crate::types::WorkerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Profile a browser process starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileMode {
    /// Empty profile, no cookies or history
    Clean,
    /// Existing profile directory (cookies, history, storage)
    Seeded(PathBuf),
}

/// One HTTP exchange observed while a page loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestRecord {
    pub url: String,
    pub initiator_type: String,
    #[serde(default)]
    pub status: u32,
    #[serde(default)]
    pub transfer_size: u64,
    #[serde(default)]
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageVisit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Status of the main document, 0 if unknown
    #[serde(default)]
    pub status: u32,
    #[serde(default)]
    pub requests: Vec<HttpRequestRecord>,
    /// Cookie jar right after the visit, only filled with cookie instrumentation on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<CookieRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Seconds since epoch, negative for session cookies
    pub expires: f64,
    pub http_only: bool,
    pub secure: bool,
    pub session: bool,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(
        &self,
        worker_id: WorkerId,
        profile: ProfileMode,
    ) -> Result<Box<dyn BrowserSession>, LaunchError>;
}

/// A running browser owned by a single worker
///
/// Calls may block for as long as the browser takes; the worker bounds every
/// step with its timeout and relaunches the browser when one expires.
#[async_trait]
pub trait BrowserSession: Send {
    /// Load `url` in the current tab and wait for navigation to finish
    async fn navigate(&mut self, url: &str) -> Result<(), StepError>;

    /// Describe the page currently loaded, including captured traffic
    async fn page_snapshot(&mut self) -> Result<PageVisit, StepError>;

    /// Links on the current page that stay on the page's domain
    async fn in_domain_links(&mut self) -> Result<Vec<String>, StepError>;

    /// Every cookie in the profile, set by script or by HTTP responses
    async fn cookies(&mut self) -> Result<Vec<CookieRecord>, StepError>;

    /// Drop all session state (cookies, storage, history)
    async fn reset_profile(&mut self) -> Result<(), StepError>;

    /// Liveness probe
    async fn is_alive(&mut self) -> bool;

    /// Release the browser process
    async fn terminate(self: Box<Self>);
}
