//! Worker bookkeeping shared by the dispatcher and the worker tasks.
//!
//! Every worker's state and the queue of callers waiting for one live under a
//! single mutex. A worker that becomes Idle is handed to the first matching
//! waiter inside the same critical section, so no other caller can claim it in
//! between and waiters are served strictly in arrival order.

use crate::metrics::Metrics;
use crate::worker::{Job, Worker};
use anyhow::{bail, Result};
use crawl_hive_common::{
    router, BrowserLauncher, CommandSequence, DataSink, DispatchError, EngineConfig,
    ExecutionResult, PoolSnapshot, ProfileMode, RouteError, RoutingKey, Site, WorkerId,
    WorkerState, WorkerStatus,
};
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Any,
    Worker(WorkerId),
}

impl Target {
    fn accepts(self, id: WorkerId) -> bool {
        match self {
            Target::Any => true,
            Target::Worker(target) => target == id,
        }
    }
}

struct Waiter {
    ticket: u64,
    target: Target,
    tx: oneshot::Sender<Result<Claim, DispatchError>>,
}

struct Registry {
    slots: Vec<WorkerStatus>,
    /// Input queue of each worker task, `None` once the worker stopped
    queues: Vec<Option<mpsc::UnboundedSender<Job>>>,
    cursor: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    closed: bool,
}

impl Registry {
    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            workers: self.slots.clone(),
            cursor: self.cursor,
        }
    }

    fn serviceable(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_serviceable()).count()
    }

    fn transition(&mut self, id: WorkerId, next: WorkerState) -> bool {
        let Some(slot) = self.slots.get_mut(id.0) else {
            error!("Transition to {} requested for unknown {}", next, id);
            return false;
        };
        if !slot.state.can_transition_to(next) {
            error!(
                "Invalid state transition for {}: {} -> {}",
                id, slot.state, next
            );
            return false;
        }
        debug!("{}: {} -> {}", id, slot.state, next);
        slot.state = next;
        if next != WorkerState::Busy {
            slot.current_site = None;
        }
        true
    }

    /// Take the first waiter that accepts `id`
    fn pop_waiter_for(&mut self, id: WorkerId) -> Option<Waiter> {
        let position = self.waiters.iter().position(|w| w.target.accepts(id))?;
        self.waiters.remove(position)
    }

    /// Drain waiters selected by `filter`
    fn drain_waiters(&mut self, filter: impl Fn(&Waiter) -> bool) -> Vec<Waiter> {
        let (drained, kept): (VecDeque<Waiter>, VecDeque<Waiter>) =
            self.waiters.drain(..).partition(|w| filter(w));
        self.waiters = kept;
        drained.into_iter().collect()
    }

    /// Move a Crashed worker out of service and collect the waiters that can
    /// no longer be served
    fn abandon_waiters_of(&mut self, id: WorkerId) -> Vec<(Waiter, DispatchError)> {
        self.queues[id.0] = None;

        let mut failed: Vec<(Waiter, DispatchError)> = self
            .drain_waiters(|w| w.target == Target::Worker(id))
            .into_iter()
            .map(|w| (w, RouteError::WorkerCrashed(id).into()))
            .collect();

        if self.serviceable() == 0 {
            failed.extend(
                self.drain_waiters(|_| true)
                    .into_iter()
                    .map(|w| (w, DispatchError::PoolExhausted)),
            );
        }
        failed
    }
}

pub(crate) struct PoolShared {
    registry: Mutex<Registry>,
    metrics: Metrics,
}

impl PoolShared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, registry: &Registry) {
        self.metrics.observe_pool(&registry.snapshot());
    }

    /// Mark `id` Idle, or hand it straight to the first waiter that wants it
    fn settle_idle(self: &Arc<Self>, mut registry: MutexGuard<'_, Registry>, id: WorkerId) {
        let handoff = match registry.pop_waiter_for(id) {
            Some(waiter) => {
                // Idle and immediately Busy again, without unlocking in between
                registry.transition(id, WorkerState::Idle);
                registry.transition(id, WorkerState::Busy);
                Some(waiter)
            }
            None => {
                registry.transition(id, WorkerState::Idle);
                None
            }
        };
        self.observe(&registry);
        drop(registry);

        if let Some(waiter) = handoff {
            debug!("Handing {} to waiting ticket {}", id, waiter.ticket);
            let claim = Claim::new(self.clone(), id);
            // The waiter gave up in the meantime; dropping the returned claim
            // releases the worker to the next waiter
            let _ = waiter.tx.send(Ok(claim));
        }
    }

    /// A sequence finished without fault
    pub(crate) fn release(self: &Arc<Self>, id: WorkerId) {
        let registry = self.registry();
        if registry.slots.get(id.0).map(|s| s.state) != Some(WorkerState::Busy) {
            error!("Release requested for {} which is not busy", id);
            return;
        }
        self.settle_idle(registry, id);
    }

    /// Busy -> Crashed -> Relaunching in one step, so nobody observes a
    /// recoverable worker as Crashed
    pub(crate) fn begin_recovery(&self, id: WorkerId) {
        let mut registry = self.registry();
        if registry.transition(id, WorkerState::Crashed) {
            registry.transition(id, WorkerState::Relaunching);
        }
        self.observe(&registry);
    }

    /// The relaunch succeeded
    pub(crate) fn recovered(self: &Arc<Self>, id: WorkerId) {
        let registry = self.registry();
        if registry.slots.get(id.0).map(|s| s.state) != Some(WorkerState::Relaunching) {
            error!("Recovery reported for {} which is not relaunching", id);
            return;
        }
        self.settle_idle(registry, id);
    }

    /// A dead browser was replaced before the sequence started; the worker
    /// goes back to running the sequence it was claimed for
    pub(crate) fn resume(&self, id: WorkerId, site: &Site) {
        let mut registry = self.registry();
        if registry.transition(id, WorkerState::Idle)
            && registry.transition(id, WorkerState::Busy)
        {
            registry.slots[id.0].current_site = Some(site.clone());
        }
        self.observe(&registry);
    }

    /// The relaunch failed; the worker is out of service for good
    pub(crate) fn retire(&self, id: WorkerId) {
        let mut registry = self.registry();
        registry.transition(id, WorkerState::Crashed);
        let failed = registry.abandon_waiters_of(id);
        let remaining = registry.serviceable();
        self.observe(&registry);
        drop(registry);

        warn!(
            "{} retired after failed relaunch, {} serviceable worker(s) left",
            id, remaining
        );
        for (waiter, err) in failed {
            let _ = waiter.tx.send(Err(err));
        }
    }

    /// The worker task vanished while holding a claim
    fn lost(&self, id: WorkerId) {
        let mut registry = self.registry();
        registry.transition(id, WorkerState::Crashed);
        let failed = registry.abandon_waiters_of(id);
        self.observe(&registry);
        drop(registry);

        error!("{} stopped unexpectedly", id);
        for (waiter, err) in failed {
            let _ = waiter.tx.send(Err(err));
        }
    }

    fn withdraw(&self, ticket: u64) -> bool {
        let mut registry = self.registry();
        let before = registry.waiters.len();
        registry.waiters.retain(|w| w.ticket != ticket);
        registry.waiters.len() != before
    }
}

/// Exclusive right to run one sequence on one worker
///
/// The worker is Busy while the claim exists. Dropping an unassigned claim
/// returns the worker to the pool.
pub struct Claim {
    pool: Arc<PoolShared>,
    worker_id: WorkerId,
    armed: bool,
}

impl Claim {
    fn new(pool: Arc<PoolShared>, worker_id: WorkerId) -> Self {
        Self {
            pool,
            worker_id,
            armed: true,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Hand `sequence` to the worker's serial input queue. The returned
    /// receiver yields the result once the worker is available again.
    pub fn assign(
        mut self,
        sequence: Arc<CommandSequence>,
        ray_id: String,
    ) -> Result<oneshot::Receiver<ExecutionResult>, DispatchError> {
        let id = self.worker_id;
        let queue = {
            let mut registry = self.pool.registry();
            if let Some(slot) = registry.slots.get_mut(id.0) {
                slot.current_site = Some(sequence.site().clone());
            }
            registry.queues.get(id.0).cloned().flatten()
        };

        let (reply, rx) = oneshot::channel();
        let job = Job {
            sequence,
            ray_id,
            reply,
        };

        match queue.map(|q| q.send(job)) {
            Some(Ok(())) => {
                self.armed = false;
                Ok(rx)
            }
            _ => {
                self.armed = false;
                self.pool.lost(id);
                Err(DispatchError::WorkerLost(id))
            }
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.armed {
            debug!("Unassigned claim on {} dropped", self.worker_id);
            self.pool.release(self.worker_id);
        }
    }
}

/// Place in the wait queue; dropping it withdraws from the queue, and a claim
/// that was already handed over is returned to the pool
pub struct Ticket {
    pool: Arc<PoolShared>,
    ticket: u64,
    rx: oneshot::Receiver<Result<Claim, DispatchError>>,
}

impl Ticket {
    pub async fn recv(&mut self) -> Result<Claim, DispatchError> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::ShuttingDown),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.pool.withdraw(self.ticket) {
            debug!("Ticket {} withdrawn from the wait queue", self.ticket);
        }
    }
}

pub enum Admission {
    /// Workers claimed right away; empty for a broadcast that found no idle worker
    Claimed(Vec<Claim>),
    /// Queued behind earlier callers until a matching worker frees up
    Waiting(Ticket),
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Launch `pool_size` browsers and start one task per worker. Workers
    /// whose browser fails to launch start out Crashed; at least one must
    /// launch.
    pub async fn start(
        config: &EngineConfig,
        launcher: Arc<dyn BrowserLauncher>,
        sink: Arc<dyn DataSink>,
        metrics: Metrics,
    ) -> Result<Self> {
        config.validate()?;
        let pool_size = config.manager.pool_size;
        let profile = match &config.browser.seed_profile {
            Some(path) => ProfileMode::Seeded(path.clone()),
            None => ProfileMode::Clean,
        };

        info!(
            "Starting worker pool '{}' with {} worker(s)",
            config.manager.pool_name, pool_size
        );

        let mut sessions = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let id = WorkerId(index);
            let launch = tokio::time::timeout(
                config.browser.launch_timeout,
                launcher.launch(id, profile.clone()),
            )
            .await;
            match launch {
                Ok(Ok(session)) => {
                    info!("Launched browser for {}", id);
                    sessions.push(Some(session));
                }
                Ok(Err(e)) => {
                    error!("{}", e);
                    sessions.push(None);
                }
                Err(_) => {
                    error!(
                        "Browser launch for {} timed out after {:?}",
                        id, config.browser.launch_timeout
                    );
                    sessions.push(None);
                }
            }
        }

        let launched = sessions.iter().filter(|s| s.is_some()).count();
        if launched == 0 {
            bail!("No browser could be launched, worker pool is empty");
        }
        if launched < pool_size {
            warn!(
                "Only {}/{} browser(s) launched, continuing with reduced capacity",
                launched, pool_size
            );
        }

        let slots = sessions
            .iter()
            .enumerate()
            .map(|(index, session)| WorkerStatus {
                id: WorkerId(index),
                state: if session.is_some() {
                    WorkerState::Idle
                } else {
                    WorkerState::Crashed
                },
                current_site: None,
            })
            .collect();

        let shared = Arc::new(PoolShared {
            registry: Mutex::new(Registry {
                slots,
                queues: vec![None; pool_size],
                cursor: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
                closed: false,
            }),
            metrics: metrics.clone(),
        });

        let mut handles = Vec::with_capacity(launched);
        for (index, session) in sessions.into_iter().enumerate() {
            let Some(session) = session else { continue };
            let id = WorkerId(index);
            let (tx, rx) = mpsc::unbounded_channel();
            shared.registry().queues[index] = Some(tx);

            let worker = Worker::new(
                id,
                session,
                launcher.clone(),
                sink.clone(),
                shared.clone(),
                config,
                metrics.clone(),
            );
            handles.push(tokio::spawn(worker.run(rx)));
        }

        shared.observe(&shared.registry());

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.shared.registry().snapshot()
    }

    pub fn size(&self) -> usize {
        self.shared.registry().slots.len()
    }

    /// Claim the workers `key` resolves to, or join the wait queue
    pub fn admit(&self, key: &RoutingKey) -> Result<Admission, DispatchError> {
        let mut registry = self.shared.registry();
        if registry.closed {
            return Err(DispatchError::ShuttingDown);
        }
        if registry.serviceable() == 0 {
            return Err(DispatchError::PoolExhausted);
        }

        let target = match router::resolve(key, &registry.snapshot()) {
            Ok(ids) => match key {
                RoutingKey::Specific(id) if registry.slots[id.0].state != WorkerState::Idle => {
                    Target::Worker(*id)
                }
                _ => {
                    let mut claims = Vec::with_capacity(ids.len());
                    for id in ids {
                        registry.transition(id, WorkerState::Busy);
                        claims.push(Claim::new(self.shared.clone(), id));
                    }
                    if *key == RoutingKey::AnyIdle {
                        if let Some(claim) = claims.first() {
                            registry.cursor = (claim.worker_id.0 + 1) % registry.slots.len();
                        }
                    }
                    self.shared.observe(&registry);
                    return Ok(Admission::Claimed(claims));
                }
            },
            Err(RouteError::NoIdleWorker) => Target::Any,
            Err(e) => return Err(e.into()),
        };

        let ticket = registry.next_ticket;
        registry.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        registry.waiters.push_back(Waiter { ticket, target, tx });
        debug!(
            "Ticket {} queued for {:?} ({} waiting)",
            ticket,
            target,
            registry.waiters.len()
        );

        Ok(Admission::Waiting(Ticket {
            pool: self.shared.clone(),
            ticket,
            rx,
        }))
    }

    /// Claim `id` only if it is Idle right now
    pub fn try_claim(&self, id: WorkerId) -> Result<Claim, DispatchError> {
        let mut registry = self.shared.registry();
        if registry.closed {
            return Err(DispatchError::ShuttingDown);
        }
        router::resolve(&RoutingKey::Specific(id), &registry.snapshot())?;
        if registry.slots[id.0].state != WorkerState::Idle {
            return Err(DispatchError::WorkerBusy(id));
        }
        registry.transition(id, WorkerState::Busy);
        self.shared.observe(&registry);
        Ok(Claim::new(self.shared.clone(), id))
    }

    /// Stop admitting work and fail every queued waiter
    pub fn close(&self) {
        let mut registry = self.shared.registry();
        registry.closed = true;
        let waiters = registry.drain_waiters(|_| true);
        drop(registry);

        if !waiters.is_empty() {
            info!("Failing {} queued submission(s) on shutdown", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.tx.send(Err(DispatchError::ShuttingDown));
        }
    }

    /// Wait until no worker is Busy or Relaunching; false if `grace` ran out
    pub async fn wait_settled(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let active = {
                let snapshot = self.snapshot();
                snapshot.count(WorkerState::Busy) + snapshot.count(WorkerState::Relaunching)
            };
            if active == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("{} worker(s) still active after {:?}", active, grace);
                return false;
            }
            debug!("Waiting for {} active worker(s)...", active);
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    /// Stop every worker task and release its browser. Workers finish the
    /// sequence they are running first, unless `abort_after` expires.
    pub async fn shutdown_workers(&self, abort_after: Duration) {
        {
            let mut registry = self.shared.registry();
            for queue in registry.queues.iter_mut() {
                *queue = None;
            }
        }

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .map(|mut h| h.drain(..).collect())
            .unwrap_or_default();

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(abort_after, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Worker task failed: {}", e);
                    }
                }
            }
            Err(_) => {
                let running = aborts.iter().filter(|a| !a.is_finished()).count();
                warn!(
                    "{} worker task(s) did not stop within {:?}, aborting",
                    running, abort_after
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        info!("All workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, FakeLauncher, ScriptedStep, StepLog};
    use crawl_hive_common::MemorySink;
    use std::time::Instant;

    async fn pool(size: usize, launcher: &FakeLauncher) -> WorkerPool {
        let mut config = EngineConfig::default();
        config.manager.pool_size = size;
        WorkerPool::start(
            &config,
            Arc::new(launcher.clone()),
            Arc::new(MemorySink::new()),
            Metrics::new("test").unwrap(),
        )
        .await
        .unwrap()
    }

    fn claimed(admission: Admission) -> Vec<Claim> {
        match admission {
            Admission::Claimed(claims) => claims,
            Admission::Waiting(_) => panic!("expected an immediate claim"),
        }
    }

    fn waiting(admission: Admission) -> Ticket {
        match admission {
            Admission::Waiting(ticket) => ticket,
            Admission::Claimed(_) => panic!("expected to wait"),
        }
    }

    #[tokio::test]
    async fn test_any_idle_rotates_and_marks_busy() {
        let launcher = FakeLauncher::new();
        let pool = pool(3, &launcher).await;

        let first = claimed(pool.admit(&RoutingKey::AnyIdle).unwrap());
        let second = claimed(pool.admit(&RoutingKey::AnyIdle).unwrap());

        assert_eq!(first[0].worker_id(), WorkerId(0));
        assert_eq!(second[0].worker_id(), WorkerId(1));
        assert_eq!(pool.snapshot().count(WorkerState::Busy), 2);
    }

    #[tokio::test]
    async fn test_dropped_claim_releases_worker() {
        let launcher = FakeLauncher::new();
        let pool = pool(1, &launcher).await;

        let claims = claimed(pool.admit(&RoutingKey::AnyIdle).unwrap());
        assert_eq!(pool.snapshot().count(WorkerState::Idle), 0);
        drop(claims);
        assert_eq!(pool.snapshot().count(WorkerState::Idle), 1);
    }

    #[tokio::test]
    async fn test_released_worker_goes_to_first_waiter() {
        let launcher = FakeLauncher::new();
        let pool = pool(1, &launcher).await;

        let claims = claimed(pool.admit(&RoutingKey::AnyIdle).unwrap());
        let mut first = waiting(pool.admit(&RoutingKey::AnyIdle).unwrap());
        let mut second = waiting(pool.admit(&RoutingKey::Specific(WorkerId(0))).unwrap());

        drop(claims);
        // Handed over without passing through an observable Idle state
        assert_eq!(pool.snapshot().count(WorkerState::Busy), 1);

        let claim = first.recv().await.unwrap();
        assert_eq!(claim.worker_id(), WorkerId(0));
        drop(claim);

        let claim = second.recv().await.unwrap();
        assert_eq!(claim.worker_id(), WorkerId(0));
    }

    #[tokio::test]
    async fn test_withdrawn_ticket_is_skipped() {
        let launcher = FakeLauncher::new();
        let pool = pool(1, &launcher).await;

        let claims = claimed(pool.admit(&RoutingKey::AnyIdle).unwrap());
        let gone = waiting(pool.admit(&RoutingKey::AnyIdle).unwrap());
        let mut next = waiting(pool.admit(&RoutingKey::AnyIdle).unwrap());
        drop(gone);
        drop(claims);

        assert_eq!(next.recv().await.unwrap().worker_id(), WorkerId(0));
    }

    #[tokio::test]
    async fn test_try_claim_busy_worker() {
        let launcher = FakeLauncher::new();
        let pool = pool(2, &launcher).await;

        let _claim = pool.try_claim(WorkerId(1)).unwrap();
        assert!(matches!(
            pool.try_claim(WorkerId(1)),
            Err(DispatchError::WorkerBusy(WorkerId(1)))
        ));
        assert!(matches!(
            pool.try_claim(WorkerId(5)),
            Err(DispatchError::Route(RouteError::UnknownWorker(WorkerId(5))))
        ));
    }

    #[tokio::test]
    async fn test_failed_launch_starts_crashed() {
        let launcher = FakeLauncher::new();
        launcher.refuse_launch(WorkerId(1));
        let pool = pool(2, &launcher).await;

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.get(WorkerId(1)).unwrap().state, WorkerState::Crashed);
        assert!(matches!(
            pool.admit(&RoutingKey::Specific(WorkerId(1))),
            Err(DispatchError::Route(RouteError::WorkerCrashed(WorkerId(1))))
        ));
    }

    #[tokio::test]
    async fn test_no_browser_launched() {
        let launcher = FakeLauncher::new();
        launcher.refuse_launch(WorkerId(0));

        let mut config = EngineConfig::default();
        config.manager.pool_size = 1;
        let result = WorkerPool::start(
            &config,
            Arc::new(launcher),
            Arc::new(MemorySink::new()),
            Metrics::new("test").unwrap(),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let launcher = FakeLauncher::new();
        let pool = pool(1, &launcher).await;

        let _claims = claimed(pool.admit(&RoutingKey::AnyIdle).unwrap());
        let mut ticket = waiting(pool.admit(&RoutingKey::AnyIdle).unwrap());
        pool.close();

        assert!(matches!(
            ticket.recv().await,
            Err(DispatchError::ShuttingDown)
        ));
        assert!(matches!(
            pool.admit(&RoutingKey::AnyIdle),
            Err(DispatchError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_resume_keeps_worker_busy_for_site() {
        let launcher = FakeLauncher::new();
        let pool = pool(1, &launcher).await;
        let _claims = claimed(pool.admit(&RoutingKey::AnyIdle).unwrap());
        let site = Site::new("https://a.org");

        pool.shared.begin_recovery(WorkerId(0));
        assert_eq!(
            pool.snapshot().get(WorkerId(0)).unwrap().state,
            WorkerState::Relaunching
        );
        let mut ticket = waiting(pool.admit(&RoutingKey::AnyIdle).unwrap());

        pool.shared.resume(WorkerId(0), &site);

        let status = pool.snapshot().get(WorkerId(0)).cloned().unwrap();
        assert_eq!(status.state, WorkerState::Busy);
        assert_eq!(status.current_site, Some(site));
        // Passing through Idle must not hand the worker to a waiter
        assert!(tokio::time::timeout(Duration::from_millis(50), ticket.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_deadline_covers_all_workers() {
        let launcher = FakeLauncher::new();
        let pool = pool(3, &launcher).await;
        let log = StepLog::default();
        let sequence = Arc::new(
            CommandSequence::builder("https://a.org")
                .step(Arc::new(ScriptedStep::new(
                    "stuck",
                    Behavior::Hang,
                    Duration::from_secs(30),
                    &log,
                )))
                .build()
                .unwrap(),
        );

        let mut pending = Vec::new();
        for _ in 0..3 {
            let claim = claimed(pool.admit(&RoutingKey::AnyIdle).unwrap()).remove(0);
            pending.push(claim.assign(sequence.clone(), "ray_test".to_string()).unwrap());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        pool.shutdown_workers(Duration::from_millis(200)).await;

        // One deadline for all three, not one per worker
        assert!(started.elapsed() < Duration::from_millis(500));
        for rx in pending {
            assert!(rx.await.is_err());
        }
    }
}
