//! Command sequences: the unit of crawl work for one site.
//!
//! A sequence is an ordered, immutable list of steps. Each step implements
//! [`Command`], so new kinds of steps can be added without touching the
//! dispatcher or the workers.
//!
//! ```rust
//! use crawl_hive_common::CommandSequence;
//! use std::time::Duration;
//!
//! let sequence = CommandSequence::builder("https://example.com")
//!     .reset(true)
//!     .browse(5, Duration::from_secs(10), Duration::from_secs(360))
//!     .dump_profile_cookies(Duration::from_secs(120))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(sequence.len(), 2);
//! ```

use crate::browser::BrowserSession;
use crate::error::{SequenceError, StepError};
use crate::types::{CaptureType, Site};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A single step of a command sequence
///
/// `execute` returns the capture payload that is appended to the data sink
/// under `capture_type()` once the step succeeds.
#[async_trait]
pub trait Command: Debug + Send + Sync {
    /// Short human-readable description used in results and logs
    fn describe(&self) -> String;

    /// Hard limit for the whole step, enforced by the worker
    fn timeout(&self) -> Duration;

    fn capture_type(&self) -> CaptureType;

    async fn execute(
        &self,
        site: &Site,
        browser: &mut dyn BrowserSession,
    ) -> Result<serde_json::Value, StepError>;
}

/// Visit the site and stay on it for `settle_sleep`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCommand {
    pub settle_sleep: Duration,
    pub timeout: Duration,
}

#[async_trait]
impl Command for GetCommand {
    fn describe(&self) -> String {
        format!("get(sleep={:?})", self.settle_sleep)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn capture_type(&self) -> CaptureType {
        CaptureType::HttpTraffic
    }

    async fn execute(
        &self,
        site: &Site,
        browser: &mut dyn BrowserSession,
    ) -> Result<serde_json::Value, StepError> {
        browser.navigate(site.as_str()).await?;
        tokio::time::sleep(self.settle_sleep).await;
        let page = browser.page_snapshot().await?;

        Ok(json!({ "site": site, "pages": [page] }))
    }
}

/// Visit the site, then up to `max_links` in-domain links found on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseCommand {
    pub max_links: u32,
    pub settle_sleep: Duration,
    pub timeout: Duration,
}

#[async_trait]
impl Command for BrowseCommand {
    fn describe(&self) -> String {
        format!(
            "browse(max_links={}, sleep={:?})",
            self.max_links, self.settle_sleep
        )
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn capture_type(&self) -> CaptureType {
        CaptureType::HttpTraffic
    }

    async fn execute(
        &self,
        site: &Site,
        browser: &mut dyn BrowserSession,
    ) -> Result<serde_json::Value, StepError> {
        browser.navigate(site.as_str()).await?;
        tokio::time::sleep(self.settle_sleep).await;
        let mut pages = vec![browser.page_snapshot().await?];

        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(site.as_str().trim_end_matches('/').to_string());
        let links: Vec<String> = browser
            .in_domain_links()
            .await?
            .into_iter()
            .filter(|link| seen.insert(link.trim_end_matches('/').to_string()))
            .take(self.max_links as usize)
            .collect();

        debug!("Following {} in-domain link(s) on {}", links.len(), site);

        let mut failed_links = Vec::new();
        for link in links {
            match browser.navigate(&link).await {
                Ok(()) => {
                    tokio::time::sleep(self.settle_sleep).await;
                    pages.push(browser.page_snapshot().await?);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // A broken link does not fail the step
                    warn!("Failed to follow link {} on {}: {}", link, site, e);
                    failed_links.push(json!({ "url": link, "error": e.to_string() }));
                }
            }
        }

        Ok(json!({ "site": site, "pages": pages, "failed_links": failed_links }))
    }
}

/// Dump every cookie of the current profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpCookiesCommand {
    pub timeout: Duration,
}

#[async_trait]
impl Command for DumpCookiesCommand {
    fn describe(&self) -> String {
        "dump_profile_cookies".to_string()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn capture_type(&self) -> CaptureType {
        CaptureType::Cookies
    }

    async fn execute(
        &self,
        site: &Site,
        browser: &mut dyn BrowserSession,
    ) -> Result<serde_json::Value, StepError> {
        let cookies = browser.cookies().await?;
        Ok(json!({ "site": site, "cookies": cookies }))
    }
}

/// Ordered, immutable list of steps for one site
///
/// Cloning is cheap; steps are shared.
#[derive(Debug, Clone)]
pub struct CommandSequence {
    site: Site,
    steps: Arc<[Arc<dyn Command>]>,
    reset_profile: bool,
}

impl CommandSequence {
    pub fn new(
        site: impl Into<Site>,
        reset_profile: bool,
        steps: Vec<Arc<dyn Command>>,
    ) -> Result<Self, SequenceError> {
        let site = site.into();

        if steps.is_empty() {
            return Err(SequenceError::EmptySequence {
                site: site.to_string(),
            });
        }

        if let Some((step_index, step)) = steps
            .iter()
            .enumerate()
            .find(|(_, step)| step.timeout().is_zero())
        {
            return Err(SequenceError::ZeroTimeout {
                site: site.to_string(),
                step_index,
                description: step.describe(),
            });
        }

        Ok(Self {
            site,
            steps: steps.into(),
            reset_profile,
        })
    }

    pub fn builder(site: impl Into<Site>) -> CommandSequenceBuilder {
        CommandSequenceBuilder {
            site: site.into(),
            reset_profile: false,
            steps: Vec::new(),
        }
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn steps(&self) -> &[Arc<dyn Command>] {
        &self.steps
    }

    pub fn reset_profile(&self) -> bool {
        self.reset_profile
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub struct CommandSequenceBuilder {
    site: Site,
    reset_profile: bool,
    steps: Vec<Arc<dyn Command>>,
}

impl CommandSequenceBuilder {
    /// Start the sequence from a clean profile
    pub fn reset(mut self, reset_profile: bool) -> Self {
        self.reset_profile = reset_profile;
        self
    }

    pub fn get(self, settle_sleep: Duration, timeout: Duration) -> Self {
        self.step(Arc::new(GetCommand {
            settle_sleep,
            timeout,
        }))
    }

    pub fn browse(self, max_links: u32, settle_sleep: Duration, timeout: Duration) -> Self {
        self.step(Arc::new(BrowseCommand {
            max_links,
            settle_sleep,
            timeout,
        }))
    }

    pub fn dump_profile_cookies(self, timeout: Duration) -> Self {
        self.step(Arc::new(DumpCookiesCommand { timeout }))
    }

    pub fn step(mut self, command: Arc<dyn Command>) -> Self {
        self.steps.push(command);
        self
    }

    pub fn build(self) -> Result<CommandSequence, SequenceError> {
        CommandSequence::new(self.site, self.reset_profile, self.steps)
    }
}
