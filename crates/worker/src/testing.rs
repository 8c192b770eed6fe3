//! Test doubles: a browser launcher that never starts a real browser, and
//! commands whose behavior is scripted.
//!
//! Fake browsers keep a per-browser cookie jar: every navigation sets a
//! `visited_<host>` cookie, a profile reset clears the jar, and a seeded
//! launch starts with a `seed` cookie.

use async_trait::async_trait;
use crawl_hive_common::{
    utils, BrowserLauncher, BrowserSession, CaptureType, Command, CookieRecord,
    HttpRequestRecord, LaunchError, PageVisit, ProfileMode, Site, StepError, WorkerId,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    profiles: HashMap<WorkerId, Vec<ProfileMode>>,
    terminations: HashMap<WorkerId, usize>,
    refused: HashSet<WorkerId>,
    dead: HashSet<WorkerId>,
    failing_reset: HashSet<WorkerId>,
    launch_delay: HashMap<WorkerId, Duration>,
    visits: Vec<(WorkerId, String)>,
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every further launch for `id` fail
    pub fn refuse_launch(&self, id: WorkerId) {
        lock(&self.state).refused.insert(id);
    }

    pub fn allow_launch(&self, id: WorkerId) {
        lock(&self.state).refused.remove(&id);
    }

    /// Kill the current browser of `id`; the next launch brings up a live one
    pub fn kill(&self, id: WorkerId) {
        lock(&self.state).dead.insert(id);
    }

    /// Make every further launch for `id` take `delay` before it completes
    pub fn slow_launch(&self, id: WorkerId, delay: Duration) {
        lock(&self.state).launch_delay.insert(id, delay);
    }

    pub fn fail_reset(&self, id: WorkerId) {
        lock(&self.state).failing_reset.insert(id);
    }

    /// Successful launches for `id`, the initial one included
    pub fn launches(&self, id: WorkerId) -> usize {
        self.profiles(id).len()
    }

    pub fn profiles(&self, id: WorkerId) -> Vec<ProfileMode> {
        lock(&self.state)
            .profiles
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn terminations(&self, id: WorkerId) -> usize {
        lock(&self.state)
            .terminations
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Every navigation, in order, with the worker that made it
    pub fn visits(&self) -> Vec<(WorkerId, String)> {
        lock(&self.state).visits.clone()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(
        &self,
        worker_id: WorkerId,
        profile: ProfileMode,
    ) -> Result<Box<dyn BrowserSession>, LaunchError> {
        let delay = lock(&self.state).launch_delay.get(&worker_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.refused.contains(&worker_id) {
            return Err(LaunchError::new(worker_id, "launch refused"));
        }
        state.dead.remove(&worker_id);
        state
            .profiles
            .entry(worker_id)
            .or_default()
            .push(profile.clone());

        let cookies = match profile {
            ProfileMode::Clean => vec![],
            ProfileMode::Seeded(_) => vec![cookie("seed", "seed.example")],
        };

        Ok(Box::new(FakeSession {
            worker_id,
            state: self.state.clone(),
            cookies,
            current: String::new(),
        }))
    }
}

fn cookie(name: &str, domain: &str) -> CookieRecord {
    CookieRecord {
        name: name.to_string(),
        value: "1".to_string(),
        domain: domain.to_string(),
        path: "/".to_string(),
        expires: -1.0,
        http_only: false,
        secure: false,
        session: true,
    }
}

pub struct FakeSession {
    worker_id: WorkerId,
    state: Arc<Mutex<FakeState>>,
    cookies: Vec<CookieRecord>,
    current: String,
}

impl FakeSession {
    fn check_alive(&self) -> Result<(), StepError> {
        if lock(&self.state).dead.contains(&self.worker_id) {
            return Err(StepError::BrowserGone("connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), StepError> {
        self.check_alive()?;
        let host = utils::extract_domain(url)
            .map_err(|e| StepError::Navigation(format!("{}: {}", url, e)))?;

        lock(&self.state)
            .visits
            .push((self.worker_id, url.to_string()));
        let name = format!("visited_{}", host);
        if !self.cookies.iter().any(|c| c.name == name) {
            self.cookies.push(cookie(&name, &host));
        }
        self.current = url.to_string();
        Ok(())
    }

    async fn page_snapshot(&mut self) -> Result<PageVisit, StepError> {
        self.check_alive()?;
        Ok(PageVisit {
            url: self.current.clone(),
            title: format!("Fake page {}", self.current),
            status: 200,
            requests: vec![HttpRequestRecord {
                url: self.current.clone(),
                initiator_type: "navigation".to_string(),
                status: 200,
                transfer_size: 512,
                duration_ms: 1.0,
            }],
            cookies: vec![],
        })
    }

    async fn in_domain_links(&mut self) -> Result<Vec<String>, StepError> {
        self.check_alive()?;
        let base = self.current.trim_end_matches('/');
        Ok((1..=3).map(|i| format!("{}/page-{}", base, i)).collect())
    }

    async fn cookies(&mut self) -> Result<Vec<CookieRecord>, StepError> {
        self.check_alive()?;
        Ok(self.cookies.clone())
    }

    async fn reset_profile(&mut self) -> Result<(), StepError> {
        self.check_alive()?;
        if lock(&self.state).failing_reset.contains(&self.worker_id) {
            return Err(StepError::Browser("profile reset refused".to_string()));
        }
        self.cookies.clear();
        self.current.clear();
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        self.check_alive().is_ok()
    }

    async fn terminate(self: Box<Self>) {
        *lock(&self.state)
            .terminations
            .entry(self.worker_id)
            .or_default() += 1;
    }
}

/// Shared record of which scripted steps were attempted, in order
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    entries: Arc<Mutex<Vec<(Site, String)>>>,
}

impl StepLog {
    pub fn entries(&self) -> Vec<(Site, String)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries().into_iter().map(|(_, name)| name).collect()
    }

    fn push(&self, site: &Site, name: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((site.clone(), name.to_string()));
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Visit the site and report success
    Succeed,
    /// Report a recoverable failure with this reason
    Fail(String),
    /// Never finish
    Hang,
    /// Report the browser process as gone
    Crash,
    /// Succeed after this long
    Sleep(Duration),
    /// Panic inside the step
    Panic,
}

#[derive(Debug, Clone)]
pub struct ScriptedStep {
    name: String,
    behavior: Behavior,
    timeout: Duration,
    log: StepLog,
}

impl ScriptedStep {
    pub fn new(name: &str, behavior: Behavior, timeout: Duration, log: &StepLog) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            timeout,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl Command for ScriptedStep {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn capture_type(&self) -> CaptureType {
        CaptureType::Custom
    }

    async fn execute(
        &self,
        site: &Site,
        browser: &mut dyn BrowserSession,
    ) -> Result<serde_json::Value, StepError> {
        self.log.push(site, &self.name);
        match &self.behavior {
            Behavior::Succeed => browser.navigate(site.as_str()).await?,
            Behavior::Fail(reason) => return Err(StepError::Browser(reason.clone())),
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Crash => {
                return Err(StepError::BrowserGone("connection is closed".to_string()))
            }
            Behavior::Sleep(duration) => tokio::time::sleep(*duration).await,
            Behavior::Panic => panic!("scripted step {} panicked", self.name),
        }
        Ok(json!({ "step": self.name, "site": site }))
    }
}
