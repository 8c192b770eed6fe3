use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque crawl target, usually a URL read from the site list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Site(String);

impl Site {
    pub fn new(site: impl Into<String>) -> Self {
        Self(site.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Site {
    fn from(site: &str) -> Self {
        Self::new(site)
    }
}

impl From<String> for Site {
    fn from(site: String) -> Self {
        Self(site)
    }
}

/// Index of a worker inside the pool, assigned at startup and never reused
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Selects which worker(s) receive a submitted sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingKey {
    /// Run on exactly this worker, waiting for it if it is busy
    Specific(WorkerId),
    /// Run on every worker that is idle right now; busy workers are skipped
    Broadcast,
    /// Run on exactly one idle worker, waiting for capacity if none is idle
    AnyIdle,
}

impl FromStr for RoutingKey {
    type Err = ();

    /// Accepts `any`, `all` (also the `*` and `**` tokens used by crawl scripts)
    /// or a numeric worker id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "any" | "any_idle" => Ok(Self::AnyIdle),
            "all" | "broadcast" | "*" | "**" => Ok(Self::Broadcast),
            other => other
                .parse::<usize>()
                .map(|id| Self::Specific(WorkerId(id)))
                .map_err(|_| ()),
        }
    }
}

/// Worker lifecycle state
///
/// | From | To | Trigger |
/// |------|----|---------|
/// | Idle | Busy | sequence assigned |
/// | Busy | Idle | sequence resolved without fault |
/// | Busy | Crashed | browser died, step timed out, too many failures |
/// | Crashed | Relaunching | recovery started |
/// | Relaunching | Idle | fresh browser launched |
/// | Relaunching | Crashed | launch failed, worker retired for good |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Crashed,
    Relaunching,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Busy)
                | (Busy, Idle)
                | (Busy, Crashed)
                | (Crashed, Relaunching)
                | (Relaunching, Idle)
                | (Relaunching, Crashed)
        )
    }

    /// Whether the worker can still take work now or after it finishes what it is doing
    pub fn is_serviceable(self) -> bool {
        !matches!(self, WorkerState::Crashed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Crashed => "crashed",
            WorkerState::Relaunching => "relaunching",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub state: WorkerState,
    /// Site of the sequence the worker is running, if any
    pub current_site: Option<Site>,
}

/// Point-in-time view of the pool used by the router
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub workers: Vec<WorkerStatus>,
    /// Round-robin position for `AnyIdle` selection
    pub cursor: usize,
}

impl PoolSnapshot {
    pub fn get(&self, id: WorkerId) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn count(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    pub fn serviceable(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state.is_serviceable())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum StepOutcome {
    Ok,
    TimedOut,
    Failed(String),
    /// Never attempted because the sequence was abandoned earlier
    Abandoned,
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::TimedOut => "timed_out",
            StepOutcome::Failed(_) => "failed",
            StepOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub step_index: usize,
    pub description: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallOutcome {
    /// Every step reported Ok
    Completed,
    /// At least one step was attempted but not every step reported Ok
    PartiallyCompleted,
    /// No step was attempted
    Abandoned,
}

impl OverallOutcome {
    pub fn from_steps(steps: &[StepStatus]) -> Self {
        if steps.iter().all(|s| s.outcome.is_ok()) {
            OverallOutcome::Completed
        } else if steps
            .iter()
            .all(|s| matches!(s.outcome, StepOutcome::Abandoned))
        {
            OverallOutcome::Abandoned
        } else {
            OverallOutcome::PartiallyCompleted
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OverallOutcome::Completed => "completed",
            OverallOutcome::PartiallyCompleted => "partially_completed",
            OverallOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub site: Site,
    pub worker_id: WorkerId,
    pub steps: Vec<StepStatus>,
    pub overall: OverallOutcome,
}

impl ExecutionResult {
    pub fn new(site: Site, worker_id: WorkerId, steps: Vec<StepStatus>) -> Self {
        let overall = OverallOutcome::from_steps(&steps);
        Self {
            site,
            worker_id,
            steps,
            overall,
        }
    }

    pub fn outcome(&self, step_index: usize) -> Option<&StepOutcome> {
        self.steps.get(step_index).map(|s| &s.outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureType {
    HttpTraffic,
    Cookies,
    /// Output of a user-defined command
    Custom,
}

impl CaptureType {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureType::HttpTraffic => "http_traffic",
            CaptureType::Cookies => "cookies",
            CaptureType::Custom => "custom",
        }
    }
}

impl fmt::Display for CaptureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
