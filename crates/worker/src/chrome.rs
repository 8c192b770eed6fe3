//! Chrome implementation of the browser capability contract, driven over CDP
//! by `headless_chrome`.
//!
//! `headless_chrome` is synchronous, so every call runs on the blocking pool.
//! The worker bounds each step with its own timeout; a call abandoned that way
//! keeps running on the blocking pool until the browser is terminated.

use async_trait::async_trait;
use crawl_hive_common::{
    utils, BrowserLauncher, BrowserParams, BrowserSession, CookieRecord, HttpRequestRecord,
    LaunchError, PageVisit, ProfileMode, StepError, WorkerId,
};
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::protocol::cdp::Target::DisposeBrowserContext;
use headless_chrome::{Browser, LaunchOptions};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Performance entries of the current page: the navigation itself and every
/// resource it loaded
const TRAFFIC_SCRIPT: &str = r#"JSON.stringify({
    title: document.title || "",
    url: document.URL,
    status: (performance.getEntriesByType('navigation')[0] || {}).responseStatus || 0,
    requests: performance.getEntriesByType('navigation')
        .concat(performance.getEntriesByType('resource'))
        .map(e => ({
            url: e.name,
            initiator_type: e.initiatorType || 'navigation',
            status: e.responseStatus || 0,
            transfer_size: e.transferSize || 0,
            duration_ms: e.duration || 0
        }))
})"#;

const LINKS_SCRIPT: &str =
    r#"JSON.stringify(Array.from(document.querySelectorAll('a[href]')).map(a => a.href))"#;

/// Check if an error indicates the browser process is dead.
fn is_dead_browser_error(error_msg: &str) -> bool {
    error_msg.contains("connection is closed") || error_msg.contains("No such process")
}

fn browser_error(e: anyhow::Error) -> StepError {
    let message = e.to_string();
    if is_dead_browser_error(&message) {
        StepError::BrowserGone(message)
    } else {
        StepError::Browser(message)
    }
}

/// Run a synchronous CDP call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, StepError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(browser_error),
        Err(e) => Err(StepError::Browser(format!("browser task failed: {}", e))),
    }
}

/// Evaluate `script` (which must return a JSON string) and decode the result
fn evaluate_json<T: for<'de> Deserialize<'de>>(tab: &Tab, script: &str) -> anyhow::Result<T> {
    let result = tab.evaluate(script, false)?;
    let json = result
        .value
        .as_ref()
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("script returned no value"))?;
    Ok(serde_json::from_str(json)?)
}

#[derive(Deserialize)]
struct Traffic {
    title: String,
    url: String,
    status: u32,
    requests: Vec<HttpRequestRecord>,
}

pub struct ChromeLauncher {
    params: BrowserParams,
}

impl ChromeLauncher {
    pub fn new(params: BrowserParams) -> Self {
        Self { params }
    }

    fn launch_blocking(
        params: &BrowserParams,
        worker_id: WorkerId,
        profile: &ProfileMode,
    ) -> anyhow::Result<ChromeSession> {
        let mut launch_builder = LaunchOptions::default_builder();
        launch_builder
            .headless(params.headless)
            .idle_browser_timeout(params.idle_browser_timeout);

        // Use custom browser path if specified (e.g., for Brave: /usr/bin/brave-browser)
        if let Some(ref browser_path) = params.browser_path {
            launch_builder.path(Some(browser_path.clone()));
        }
        if let ProfileMode::Seeded(dir) = profile {
            info!("{}: launching from seed profile {}", worker_id, dir.display());
            launch_builder.user_data_dir(Some(dir.clone()));
        }

        let launch_options = launch_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build launch options: {}", e))?;

        let browser = Arc::new(Browser::new(launch_options)?);

        // A seeded profile lives in the default context; a clean one gets an
        // isolated CDP context (like incognito, separate cookies/storage)
        let (tab, context_id) = match profile {
            ProfileMode::Seeded(_) => (browser.new_tab()?, None),
            ProfileMode::Clean => {
                let (tab, id) = Self::isolated_tab(&browser)?;
                (tab, Some(id))
            }
        };

        Ok(ChromeSession {
            worker_id,
            browser,
            tab,
            context_id,
            params: params.clone(),
        })
    }

    fn isolated_tab(browser: &Browser) -> anyhow::Result<(Arc<Tab>, String)> {
        let context = browser
            .new_context()
            .map_err(|e| anyhow::anyhow!("Failed to create isolated CDP context: {}", e))?;
        let context_id = context.get_id().to_string();
        let tab = context
            .new_tab()
            .map_err(|e| anyhow::anyhow!("Failed to create tab in isolated context: {}", e))?;
        Ok((tab, context_id))
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(
        &self,
        worker_id: WorkerId,
        profile: ProfileMode,
    ) -> Result<Box<dyn BrowserSession>, LaunchError> {
        let params = self.params.clone();
        let session = tokio::task::spawn_blocking(move || {
            Self::launch_blocking(&params, worker_id, &profile)
        })
        .await
        .map_err(|e| LaunchError::new(worker_id, format!("launch task failed: {}", e)))?
        .map_err(|e| {
            tracing::error!(
                "Browser failed to launch for {}: {}. \
                 Check that the browser binary exists and has correct permissions.",
                worker_id,
                e
            );
            LaunchError::new(worker_id, e.to_string())
        })?;

        info!("{}: browser process launched", worker_id);
        Ok(Box::new(session))
    }
}

pub struct ChromeSession {
    worker_id: WorkerId,
    browser: Arc<Browser>,
    tab: Arc<Tab>,
    /// CDP BrowserContext of the tab, None for the default context
    context_id: Option<String>,
    params: BrowserParams,
}

impl ChromeSession {
    /// Every cookie of the tab's browser context, third-party ones included.
    /// `Tab::get_cookies` only returns those sent to the current URL.
    fn cookies_blocking(tab: &Tab) -> anyhow::Result<Vec<CookieRecord>> {
        let all = tab.call_method(Network::GetAllCookies(None))?;
        Ok(cookie_records(all))
    }
}

fn cookie_records(all: Network::GetAllCookiesReturnObject) -> Vec<CookieRecord> {
    all.cookies
        .into_iter()
        .map(|c| CookieRecord {
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: c.path,
            expires: c.expires,
            http_only: c.http_only,
            secure: c.secure,
            session: c.session,
        })
        .collect()
}

fn dispose_request(context_id: &str) -> DisposeBrowserContext {
    DisposeBrowserContext {
        browser_context_id: context_id.to_string(),
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), StepError> {
        let tab = self.tab.clone();
        let url = url.to_string();
        blocking(move || {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
        .map_err(|e| match e {
            StepError::Browser(message) => StepError::Navigation(message),
            other => other,
        })
    }

    async fn page_snapshot(&mut self) -> Result<PageVisit, StepError> {
        let tab = self.tab.clone();
        let http_instrument = self.params.http_instrument;
        let cookie_instrument = self.params.cookie_instrument;

        blocking(move || {
            let traffic: Traffic = evaluate_json(&tab, TRAFFIC_SCRIPT)?;
            let cookies = if cookie_instrument {
                Self::cookies_blocking(&tab)?
            } else {
                Vec::new()
            };
            Ok(PageVisit {
                url: traffic.url,
                title: traffic.title,
                status: traffic.status,
                requests: if http_instrument {
                    traffic.requests
                } else {
                    Vec::new()
                },
                cookies,
            })
        })
        .await
    }

    async fn in_domain_links(&mut self) -> Result<Vec<String>, StepError> {
        let tab = self.tab.clone();
        blocking(move || {
            let hrefs: Vec<String> = evaluate_json(&tab, LINKS_SCRIPT)?;
            let base = tab.get_url();
            Ok(hrefs
                .iter()
                .filter_map(|href| utils::in_domain_link(&base, href))
                .collect())
        })
        .await
    }

    async fn cookies(&mut self) -> Result<Vec<CookieRecord>, StepError> {
        let tab = self.tab.clone();
        blocking(move || Self::cookies_blocking(&tab)).await
    }

    /// Move to a fresh isolated context and dispose of the old one with
    /// everything it stored
    async fn reset_profile(&mut self) -> Result<(), StepError> {
        let browser = self.browser.clone();
        let old_tab = self.tab.clone();
        let old_context = self.context_id.clone();
        let worker_id = self.worker_id;

        let (tab, context_id) = blocking(move || {
            let _ = old_tab.close(false);
            let (tab, context_id) = ChromeLauncher::isolated_tab(&browser)?;
            // headless_chrome only exposes page sessions, so the dispose goes
            // through the new tab. A context that survives has no tabs left and
            // goes away with the browser process.
            if let Some(old) = old_context {
                if let Err(e) = tab.call_method(dispose_request(&old)) {
                    warn!(
                        "{}: could not dispose CDP context {}, it stays until the browser exits: {}",
                        worker_id, old, e
                    );
                }
            }
            Ok((tab, context_id))
        })
        .await?;

        debug!("{}: profile reset, new CDP context {}", self.worker_id, context_id);
        self.tab = tab;
        self.context_id = Some(context_id);
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        let tab = self.tab.clone();
        blocking(move || {
            tab.evaluate("1", false)?;
            Ok(())
        })
        .await
        .is_ok()
    }

    async fn terminate(self: Box<Self>) {
        let worker_id = self.worker_id;
        let tab = self.tab.clone();
        // Dropping the last Browser handle kills the process
        let result = tokio::task::spawn_blocking(move || {
            let _ = tab.close(false);
            drop(self);
        })
        .await;
        if let Err(e) = result {
            warn!("{}: failed to terminate browser: {}", worker_id, e);
        }
    }
}
