use crate::metrics::Metrics;
use crate::pool::PoolShared;
use crawl_hive_common::{
    append_with_retry, BrowserLauncher, BrowserSession, CaptureRecord, CommandSequence,
    DataSink, EngineConfig, ExecutionResult, LaunchError, ManagerParams, ProfileMode,
    StepError, StepOutcome, StepStatus, WorkerId,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// One sequence handed to a worker through its input queue
pub(crate) struct Job {
    pub sequence: Arc<CommandSequence>,
    pub ray_id: String,
    pub reply: oneshot::Sender<ExecutionResult>,
}

/// Owns one browser and runs the sequences assigned to it, strictly one at a time
pub(crate) struct Worker {
    id: WorkerId,
    session: Option<Box<dyn BrowserSession>>,
    launcher: Arc<dyn BrowserLauncher>,
    sink: Arc<dyn DataSink>,
    pool: Arc<PoolShared>,
    params: ManagerParams,
    launch_timeout: Duration,
    metrics: Metrics,
}

/// Why the browser has to be replaced after a sequence
type Fault = String;

fn panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result of a sequence none of whose steps produced an outcome
fn abandoned(sequence: &CommandSequence, id: WorkerId) -> ExecutionResult {
    let steps = sequence
        .steps()
        .iter()
        .enumerate()
        .map(|(step_index, step)| StepStatus {
            step_index,
            description: step.describe(),
            outcome: StepOutcome::Abandoned,
        })
        .collect();
    ExecutionResult::new(sequence.site().clone(), id, steps)
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        session: Box<dyn BrowserSession>,
        launcher: Arc<dyn BrowserLauncher>,
        sink: Arc<dyn DataSink>,
        pool: Arc<PoolShared>,
        config: &EngineConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            id,
            session: Some(session),
            launcher,
            sink,
            pool,
            params: config.manager.clone(),
            launch_timeout: config.browser.launch_timeout,
            metrics,
        }
    }

    pub(crate) async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        debug!("{} ready", self.id);

        while let Some(job) = jobs.recv().await {
            let ray_id = job.ray_id.clone();
            let start = Instant::now();

            let (result, fault) = match AssertUnwindSafe(self.execute(&job.sequence, &ray_id))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic_info) => {
                    let message = panic_message(&panic_info);
                    error!(
                        ray_id = %ray_id,
                        worker_id = %self.id,
                        panic = %message,
                        "Sequence panicked"
                    );
                    (
                        abandoned(&job.sequence, self.id),
                        Some(format!("sequence panicked: {}", message)),
                    )
                }
            };

            let retired = match fault {
                Some(reason) => {
                    warn!(
                        ray_id = %ray_id,
                        worker_id = %self.id,
                        "Recovering browser: {}", reason
                    );
                    !self.recover(&ray_id).await
                }
                None => {
                    self.pool.release(self.id);
                    false
                }
            };

            self.metrics.observe_sequence(result.overall);
            info!(
                ray_id = %ray_id,
                worker_id = %self.id,
                "Sequence for {} {} in {}ms",
                result.site,
                result.overall.as_str(),
                start.elapsed().as_millis()
            );

            // The worker is Idle (or retired) before the caller hears back
            if job.reply.send(result).is_err() {
                debug!(ray_id = %ray_id, "Caller no longer waiting for the result");
            }

            if retired {
                break;
            }
        }

        if let Some(session) = self.session.take() {
            self.terminate(session).await;
        }
        debug!("{} stopped", self.id);
    }

    /// Run every step of `sequence` in order. Returns the result and, when
    /// the browser must be replaced, the reason.
    async fn execute(
        &mut self,
        sequence: &CommandSequence,
        ray_id: &str,
    ) -> (ExecutionResult, Option<Fault>) {
        let site = sequence.site();
        let mut statuses = Vec::with_capacity(sequence.len());
        let mut fault: Option<Fault> = None;

        info!(
            ray_id = %ray_id,
            worker_id = %self.id,
            "Starting {} step(s) for {} (reset_profile: {})",
            sequence.len(),
            site,
            sequence.reset_profile()
        );

        // A browser that died between sequences is replaced before step 0
        if !self.probe().await {
            warn!(ray_id = %ray_id, worker_id = %self.id, "Browser is not responding, relaunching");
            self.pool.begin_recovery(self.id);
            if let Some(session) = self.session.take() {
                self.terminate(session).await;
            }
            match self.launch(ProfileMode::Clean).await {
                Ok(session) => {
                    self.metrics.observe_relaunch(true);
                    self.session = Some(session);
                    // Busy again for this sequence, without passing through Idle
                    self.pool.resume(self.id, site);
                }
                Err(e) => {
                    self.metrics.observe_relaunch(false);
                    fault = Some(e.to_string());
                }
            }
        }

        if fault.is_none() && sequence.reset_profile() {
            fault = self.reset_profile(ray_id).await;
        }

        let mut consecutive_failures = 0u32;
        for (step_index, step) in sequence.steps().iter().enumerate() {
            let description = step.describe();

            let runnable = fault.is_none();
            let outcome = match self.session.as_mut().filter(|_| runnable) {
                Some(session) => {
                    debug!(
                        ray_id = %ray_id,
                        worker_id = %self.id,
                        "Step {}: {}", step_index, description
                    );
                    let attempt = AssertUnwindSafe(step.execute(site, &mut **session))
                        .catch_unwind()
                        .map(|caught| {
                            caught.unwrap_or_else(|panic_info| {
                                Err(StepError::Panicked(panic_message(&panic_info)))
                            })
                        });
                    match tokio::time::timeout(step.timeout(), attempt).await {
                        Ok(Ok(payload)) => {
                            consecutive_failures = 0;
                            let record = CaptureRecord::new(
                                site.clone(),
                                self.id,
                                step.capture_type(),
                                step_index,
                                payload,
                            );
                            match append_with_retry(
                                self.sink.as_ref(),
                                &record,
                                self.params.sink_retry_attempts,
                                self.params.sink_retry_backoff,
                            )
                            .await
                            {
                                Ok(()) => StepOutcome::Ok,
                                Err(e) => {
                                    error!(
                                        ray_id = %ray_id,
                                        worker_id = %self.id,
                                        "Capture of step {} lost: {}", step_index, e
                                    );
                                    self.metrics.observe_sink_failure();
                                    StepOutcome::Failed(format!("sink write failed: {}", e))
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            consecutive_failures += 1;
                            warn!(
                                ray_id = %ray_id,
                                worker_id = %self.id,
                                "Step {} ({}) failed: {}", step_index, description, e
                            );
                            if e.is_fatal() {
                                fault = Some(e.to_string());
                            } else if consecutive_failures >= self.params.max_consecutive_failures
                            {
                                fault = Some(format!(
                                    "{} consecutive step failures",
                                    consecutive_failures
                                ));
                            }
                            StepOutcome::Failed(e.to_string())
                        }
                        Err(_) => {
                            warn!(
                                ray_id = %ray_id,
                                worker_id = %self.id,
                                "Step {} ({}) timed out after {:?}",
                                step_index,
                                description,
                                step.timeout()
                            );
                            fault = Some(format!("step {} timed out", step_index));
                            StepOutcome::TimedOut
                        }
                    }
                }
                None => StepOutcome::Abandoned,
            };

            self.metrics.observe_step(&outcome);
            statuses.push(StepStatus {
                step_index,
                description,
                outcome,
            });
        }

        (ExecutionResult::new(site.clone(), self.id, statuses), fault)
    }

    async fn reset_profile(&mut self, ray_id: &str) -> Option<Fault> {
        let session = self.session.as_mut()?;
        match tokio::time::timeout(self.params.reset_timeout, session.reset_profile()).await {
            Ok(Ok(())) => {
                debug!(ray_id = %ray_id, worker_id = %self.id, "Profile reset");
                None
            }
            Ok(Err(e)) => Some(format!("profile reset failed: {}", e)),
            Err(_) => Some(format!(
                "profile reset timed out after {:?}",
                self.params.reset_timeout
            )),
        }
    }

    async fn probe(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        tokio::time::timeout(self.params.liveness_probe_timeout, session.is_alive())
            .await
            .unwrap_or(false)
    }

    /// Busy -> Crashed -> Relaunching -> Idle, or Crashed for good when no
    /// browser can be launched. Returns false if the worker was retired.
    async fn recover(&mut self, ray_id: &str) -> bool {
        self.pool.begin_recovery(self.id);

        if let Some(session) = self.session.take() {
            self.terminate(session).await;
        }

        match self.launch(ProfileMode::Clean).await {
            Ok(session) => {
                self.session = Some(session);
                self.metrics.observe_relaunch(true);
                info!(ray_id = %ray_id, worker_id = %self.id, "Browser relaunched");
                self.pool.recovered(self.id);
                true
            }
            Err(e) => {
                self.metrics.observe_relaunch(false);
                error!(ray_id = %ray_id, worker_id = %self.id, "{}", e);
                self.pool.retire(self.id);
                false
            }
        }
    }

    async fn launch(&mut self, profile: ProfileMode) -> Result<Box<dyn BrowserSession>, LaunchError> {
        tokio::time::timeout(self.launch_timeout, self.launcher.launch(self.id, profile))
            .await
            .unwrap_or_else(|_| {
                Err(LaunchError::new(
                    self.id,
                    format!("launch timed out after {:?}", self.launch_timeout),
                ))
            })
    }

    async fn terminate(&mut self, session: Box<dyn BrowserSession>) {
        if tokio::time::timeout(self.params.liveness_probe_timeout, session.terminate())
            .await
            .is_err()
        {
            warn!("{}: browser did not terminate in time, abandoning it", self.id);
        }
    }
}
