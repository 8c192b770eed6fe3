use anyhow::Result;
use crawl_hive_common::{
    BrowserLauncher, CommandSequence, DataSink, DispatchError, EngineConfig, ExecutionResult,
    PoolSnapshot, RouteError, RoutingKey, StepOutcome, StepStatus, WorkerId,
};
use crawl_hive_worker::{Admission, Claim, Metrics, Ticket, WorkerPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long stopped workers get to release their browsers
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// RAII guard that tracks submissions still waiting for a worker
struct ActiveSubmissionGuard {
    counter: Arc<AtomicUsize>,
}

impl ActiveSubmissionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveSubmissionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-submission knobs; they only apply until the sequence is assigned
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Give up with `WaitTimedOut` if no worker frees up in time
    pub wait_timeout: Option<Duration>,
    /// Give up with `Cancelled` once this token fires
    pub cancellation: Option<CancellationToken>,
    /// Never wait: a busy `Specific` target fails with `WorkerBusy`, and
    /// `AnyIdle` without an idle worker fails with `NoIdleWorker`
    pub fail_fast: bool,
}

/// A sequence assigned to one or more workers and still running
pub struct PendingExecution {
    ray_id: String,
    sequence: Arc<CommandSequence>,
    replies: Vec<(WorkerId, oneshot::Receiver<ExecutionResult>)>,
    /// Workers that vanished before accepting the sequence
    lost: Vec<WorkerId>,
}

impl PendingExecution {
    pub fn ray_id(&self) -> &str {
        &self.ray_id
    }

    /// Workers the sequence was assigned to, ascending
    pub fn workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .replies
            .iter()
            .map(|(id, _)| *id)
            .chain(self.lost.iter().copied())
            .collect();
        ids.sort();
        ids
    }

    /// Wait for every assigned worker to finish, one result per worker in
    /// ascending worker order. A worker that stops without reporting yields
    /// a result with every step `Abandoned`.
    pub async fn wait(self) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(self.replies.len() + self.lost.len());
        for (worker_id, rx) in self.replies {
            match rx.await {
                Ok(result) => results.push(result),
                Err(_) => {
                    warn!(
                        ray_id = %self.ray_id,
                        "{} stopped before reporting a result", worker_id
                    );
                    results.push(abandoned(&self.sequence, worker_id));
                }
            }
        }
        for worker_id in self.lost {
            results.push(abandoned(&self.sequence, worker_id));
        }
        results.sort_by_key(|r| r.worker_id);
        results
    }
}

fn abandoned(sequence: &CommandSequence, worker_id: WorkerId) -> ExecutionResult {
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
    ExecutionResult::new(sequence.site().clone(), worker_id, steps)
}

/// Turns command sequences into work on the worker pool
///
/// Callers suspend only while waiting for a worker to be assigned; once
/// assigned, a sequence runs to completion whatever the caller does.
pub struct TaskManager {
    pool: WorkerPool,
    sink: Arc<dyn DataSink>,
    metrics: Metrics,
    active_submissions: Arc<AtomicUsize>,
    accepting: AtomicBool,
}

impl TaskManager {
    /// Launch the worker pool described by `config`
    pub async fn launch(
        config: EngineConfig,
        launcher: Arc<dyn BrowserLauncher>,
        sink: Arc<dyn DataSink>,
    ) -> Result<Self> {
        let metrics = Metrics::new(&config.manager.pool_name)?;
        let pool = WorkerPool::start(&config, launcher, sink.clone(), metrics.clone()).await?;

        info!(
            "Task manager ready with {} worker(s) in pool '{}'",
            pool.size(),
            config.manager.pool_name
        );

        Ok(Self {
            pool,
            sink,
            metrics,
            active_submissions: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    /// Submissions currently waiting for a worker
    pub fn waiting_submissions(&self) -> usize {
        self.active_submissions.load(Ordering::SeqCst)
    }

    /// Run `sequence` and wait for every targeted worker to finish
    pub async fn execute(
        &self,
        sequence: CommandSequence,
        key: RoutingKey,
    ) -> Result<Vec<ExecutionResult>, DispatchError> {
        self.execute_with(sequence, key, SubmitOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        sequence: CommandSequence,
        key: RoutingKey,
        options: SubmitOptions,
    ) -> Result<Vec<ExecutionResult>, DispatchError> {
        Ok(self.dispatch(sequence, key, options).await?.wait().await)
    }

    /// Run `sequence` on a single worker and wait for its result
    pub async fn submit(
        &self,
        sequence: CommandSequence,
        key: RoutingKey,
    ) -> Result<ExecutionResult, DispatchError> {
        self.submit_with(sequence, key, SubmitOptions::default())
            .await
    }

    pub async fn submit_with(
        &self,
        sequence: CommandSequence,
        key: RoutingKey,
        options: SubmitOptions,
    ) -> Result<ExecutionResult, DispatchError> {
        if key == RoutingKey::Broadcast {
            return Err(DispatchError::BroadcastNotSingle);
        }
        let pending = self.dispatch(sequence, key, options).await?;
        let worker_id = pending.workers().first().copied();
        match (pending.wait().await.pop(), worker_id) {
            (Some(result), _) => Ok(result),
            (None, Some(id)) => Err(DispatchError::WorkerLost(id)),
            (None, None) => Err(DispatchError::PoolExhausted),
        }
    }

    /// Assign `sequence` and return without waiting for it to run. The call
    /// itself only waits for a worker to be assigned.
    pub async fn dispatch(
        &self,
        sequence: CommandSequence,
        key: RoutingKey,
        options: SubmitOptions,
    ) -> Result<PendingExecution, DispatchError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        if options
            .cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
        {
            return Err(DispatchError::Cancelled);
        }

        let _guard = ActiveSubmissionGuard::new(self.active_submissions.clone());
        let ray_id = format!("ray_{}", Uuid::new_v4());

        debug!(
            ray_id = %ray_id,
            "Dispatching {} ({} step(s)) with {:?}",
            sequence.site(),
            sequence.len(),
            key
        );

        let claims = match (key, options.fail_fast) {
            (RoutingKey::Specific(id), true) => vec![self.pool.try_claim(id)?],
            _ => match self.pool.admit(&key)? {
                Admission::Claimed(claims) => claims,
                Admission::Waiting(_) if options.fail_fast => {
                    return Err(RouteError::NoIdleWorker.into())
                }
                Admission::Waiting(ticket) => {
                    info!(
                        ray_id = %ray_id,
                        "No worker available for {}, waiting", sequence.site()
                    );
                    vec![self.wait_for_worker(ticket, &options).await?]
                }
            },
        };

        if claims.is_empty() {
            info!(
                ray_id = %ray_id,
                "Broadcast of {} found no idle worker", sequence.site()
            );
        }

        let sequence = Arc::new(sequence);
        let mut replies = Vec::with_capacity(claims.len());
        let mut lost = Vec::new();
        let single_target = key != RoutingKey::Broadcast;

        for claim in claims {
            let worker_id = claim.worker_id();
            match claim.assign(sequence.clone(), ray_id.clone()) {
                Ok(rx) => {
                    info!(
                        ray_id = %ray_id,
                        worker_id = %worker_id,
                        "Assigned {}", sequence.site()
                    );
                    replies.push((worker_id, rx));
                }
                Err(e) if single_target => return Err(e),
                Err(e) => {
                    warn!(ray_id = %ray_id, "{}", e);
                    lost.push(worker_id);
                }
            }
        }

        Ok(PendingExecution {
            ray_id,
            sequence,
            replies,
            lost,
        })
    }

    async fn wait_for_worker(
        &self,
        mut ticket: Ticket,
        options: &SubmitOptions,
    ) -> Result<Claim, DispatchError> {
        let cancelled = async {
            match &options.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let timed_out = async {
            match options.wait_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        // Dropping the ticket on the error paths leaves the queue
        tokio::select! {
            claim = ticket.recv() => claim,
            _ = cancelled => Err(DispatchError::Cancelled),
            _ = timed_out => Err(DispatchError::WaitTimedOut(
                options.wait_timeout.unwrap_or_default(),
            )),
        }
    }

    /// Stop accepting work, fail queued submissions, wait up to `grace` for
    /// busy workers, then release every browser and flush the sink
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Shutting down task manager (grace period {:?})", grace);
        }

        self.pool.close();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.active_submissions.load(Ordering::SeqCst);
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            debug!("Waiting for {} submission(s) to unwind...", remaining);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        if self.pool.wait_settled(left).await {
            info!("All workers idle");
        } else {
            warn!("Grace period expired with workers still busy");
        }

        self.pool.shutdown_workers(WORKER_STOP_TIMEOUT).await;
        self.sink.flush().await?;

        info!("Task manager shutdown complete");
        Ok(())
    }
}
