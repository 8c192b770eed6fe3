use async_trait::async_trait;
use crawl_hive_common::{
    BrowserSession, CaptureType, Command, CommandSequence, DispatchError, EngineConfig,
    MemorySink, OverallOutcome, RouteError, RoutingKey, Site, StepError, StepOutcome, WorkerId,
    WorkerState,
};
use crawl_hive_dispatcher::{SubmitOptions, TaskManager};
use crawl_hive_worker::testing::{Behavior, FakeLauncher, ScriptedStep, StepLog};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Harness {
    manager: Arc<TaskManager>,
    launcher: FakeLauncher,
    sink: Arc<MemorySink>,
    log: StepLog,
}

async fn harness(pool_size: usize) -> Harness {
    harness_with(pool_size, |_| {}).await
}

async fn harness_with(pool_size: usize, prepare: impl FnOnce(&FakeLauncher)) -> Harness {
    let mut config = EngineConfig::default();
    config.manager.pool_size = pool_size;
    config.manager.sink_retry_backoff = Duration::from_millis(1);

    let launcher = FakeLauncher::new();
    prepare(&launcher);
    let sink = Arc::new(MemorySink::new());
    let manager = TaskManager::launch(config, Arc::new(launcher.clone()), sink.clone())
        .await
        .unwrap();

    Harness {
        manager: Arc::new(manager),
        launcher,
        sink,
        log: StepLog::default(),
    }
}

impl Harness {
    fn step(&self, name: &str, behavior: Behavior) -> Arc<dyn Command> {
        Arc::new(ScriptedStep::new(
            name,
            behavior,
            Duration::from_millis(500),
            &self.log,
        ))
    }

    fn sequence(&self, site: &str, steps: &[(&str, Behavior)]) -> CommandSequence {
        steps
            .iter()
            .fold(CommandSequence::builder(site), |builder, (name, behavior)| {
                builder.step(self.step(name, behavior.clone()))
            })
            .build()
            .unwrap()
    }
}

/// Sleeps while tracking how many steps run at once
#[derive(Debug)]
struct Tracked {
    sleep: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    intervals: Arc<Mutex<Vec<(Site, Instant, Instant)>>>,
}

#[async_trait]
impl Command for Tracked {
    fn describe(&self) -> String {
        "tracked".to_string()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn capture_type(&self) -> CaptureType {
        CaptureType::Custom
    }

    async fn execute(
        &self,
        site: &Site,
        _browser: &mut dyn BrowserSession,
    ) -> Result<serde_json::Value, StepError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let start = Instant::now();
        tokio::time::sleep(self.sleep).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut intervals) = self.intervals.lock() {
            intervals.push((site.clone(), start, Instant::now()));
        }
        Ok(serde_json::json!({ "site": site }))
    }
}

#[tokio::test]
async fn test_completed_sequence_writes_one_capture_per_step() {
    let h = harness(1).await;
    let sequence = h.sequence(
        "https://a.org",
        &[
            ("one", Behavior::Succeed),
            ("two", Behavior::Succeed),
            ("three", Behavior::Succeed),
        ],
    );

    let result = h
        .manager
        .submit(sequence, RoutingKey::AnyIdle)
        .await
        .unwrap();

    assert_eq!(result.overall, OverallOutcome::Completed);
    assert!(result.steps.iter().all(|s| s.outcome == StepOutcome::Ok));
    let records = h.sink.records_for(&Site::new("https://a.org"), result.worker_id);
    assert_eq!(records.len(), 3);
    assert_eq!(
        records.iter().map(|r| r.step_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
}

#[tokio::test]
async fn test_timed_out_step_abandons_the_rest() {
    let h = harness(1).await;
    let sequence = h.sequence(
        "https://a.org",
        &[
            ("one", Behavior::Succeed),
            ("two", Behavior::Succeed),
            ("stuck", Behavior::Hang),
            ("four", Behavior::Succeed),
            ("five", Behavior::Succeed),
        ],
    );

    let result = h
        .manager
        .submit(sequence, RoutingKey::Specific(WorkerId(0)))
        .await
        .unwrap();

    assert_eq!(result.overall, OverallOutcome::PartiallyCompleted);
    assert_eq!(
        result
            .steps
            .iter()
            .map(|s| s.outcome.clone())
            .collect::<Vec<_>>(),
        vec![
            StepOutcome::Ok,
            StepOutcome::Ok,
            StepOutcome::TimedOut,
            StepOutcome::Abandoned,
            StepOutcome::Abandoned,
        ]
    );
    assert_eq!(h.log.names(), vec!["one", "two", "stuck"]);
    assert_eq!(h.sink.len(), 2);
}

#[tokio::test]
async fn test_reset_profile_hides_cookies_of_previous_sequence() {
    let h = harness(1).await;
    let visit = CommandSequence::builder("https://a.org")
        .get(Duration::ZERO, Duration::from_secs(1))
        .build()
        .unwrap();
    let dump = |reset: bool| {
        CommandSequence::builder("https://b.org")
            .reset(reset)
            .dump_profile_cookies(Duration::from_secs(1))
            .build()
            .unwrap()
    };

    h.manager.submit(visit.clone(), RoutingKey::AnyIdle).await.unwrap();
    h.manager.submit(dump(false), RoutingKey::AnyIdle).await.unwrap();
    h.manager.submit(visit, RoutingKey::AnyIdle).await.unwrap();
    h.manager.submit(dump(true), RoutingKey::AnyIdle).await.unwrap();

    let dumps: Vec<serde_json::Value> = h
        .sink
        .records()
        .into_iter()
        .filter(|r| r.capture_type == CaptureType::Cookies)
        .map(|r| r.payload)
        .collect();
    assert_eq!(dumps.len(), 2);
    assert_eq!(dumps[0]["cookies"][0]["name"], "visited_a.org");
    assert!(dumps[1]["cookies"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_specific_key_never_uses_another_worker() {
    let h = harness_with(3, |launcher| launcher.refuse_launch(WorkerId(1))).await;

    for i in 0..3 {
        let sequence = h.sequence(&format!("https://site-{}.org", i), &[("visit", Behavior::Succeed)]);
        let result = h
            .manager
            .submit(sequence, RoutingKey::Specific(WorkerId(2)))
            .await
            .unwrap();
        assert_eq!(result.worker_id, WorkerId(2));
    }
    assert!(h.launcher.visits().iter().all(|(id, _)| *id == WorkerId(2)));

    for _ in 0..2 {
        let sequence = h.sequence("https://a.org", &[("visit", Behavior::Succeed)]);
        let err = h
            .manager
            .submit(sequence, RoutingKey::Specific(WorkerId(1)))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Route(RouteError::WorkerCrashed(WorkerId(1))));
    }

    let sequence = h.sequence("https://a.org", &[("visit", Behavior::Succeed)]);
    assert_eq!(
        h.manager
            .submit(sequence, RoutingKey::Specific(WorkerId(9)))
            .await
            .unwrap_err(),
        DispatchError::Route(RouteError::UnknownWorker(WorkerId(9)))
    );
}

#[tokio::test]
async fn test_specific_key_waits_for_busy_worker() {
    let h = harness(2).await;
    let slow = h.sequence("https://slow.org", &[("slow", Behavior::Sleep(Duration::from_millis(150)))]);
    let quick = h.sequence("https://quick.org", &[("quick", Behavior::Succeed)]);

    let running = h
        .manager
        .dispatch(slow, RoutingKey::Specific(WorkerId(0)), SubmitOptions::default())
        .await
        .unwrap();
    let start = Instant::now();
    let result = h
        .manager
        .submit(quick, RoutingKey::Specific(WorkerId(0)))
        .await
        .unwrap();

    assert_eq!(result.worker_id, WorkerId(0));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(h.log.names(), vec!["slow", "quick"]);
    running.wait().await;
}

#[tokio::test]
async fn test_broadcast_runs_once_per_idle_worker() {
    let h = harness(3).await;
    let sequence = h.sequence("https://a.org", &[("visit", Behavior::Succeed)]);

    let results = h
        .manager
        .execute(sequence, RoutingKey::Broadcast)
        .await
        .unwrap();

    assert_eq!(
        results.iter().map(|r| r.worker_id).collect::<Vec<_>>(),
        vec![WorkerId(0), WorkerId(1), WorkerId(2)]
    );
    assert!(results.iter().all(|r| r.overall == OverallOutcome::Completed));
    for id in 0..3 {
        assert_eq!(
            h.sink
                .records_for(&Site::new("https://a.org"), WorkerId(id))
                .len(),
            1
        );
    }
}

#[tokio::test]
async fn test_broadcast_skips_busy_workers() {
    let h = harness(2).await;
    let slow = h.sequence("https://slow.org", &[("slow", Behavior::Sleep(Duration::from_millis(100)))]);
    let running = h
        .manager
        .dispatch(slow, RoutingKey::Specific(WorkerId(1)), SubmitOptions::default())
        .await
        .unwrap();

    let sequence = h.sequence("https://a.org", &[("visit", Behavior::Succeed)]);
    let results = h
        .manager
        .execute(sequence, RoutingKey::Broadcast)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].worker_id, WorkerId(0));
    running.wait().await;

    let busy = h.sequence("https://slow.org", &[("slow", Behavior::Sleep(Duration::from_millis(100)))]);
    let first = h
        .manager
        .dispatch(busy.clone(), RoutingKey::Specific(WorkerId(0)), SubmitOptions::default())
        .await
        .unwrap();
    let second = h
        .manager
        .dispatch(busy, RoutingKey::Specific(WorkerId(1)), SubmitOptions::default())
        .await
        .unwrap();
    let sequence = h.sequence("https://b.org", &[("visit", Behavior::Succeed)]);
    assert!(h
        .manager
        .execute(sequence, RoutingKey::Broadcast)
        .await
        .unwrap()
        .is_empty());
    first.wait().await;
    second.wait().await;
}

#[tokio::test]
async fn test_any_idle_never_double_assigns() {
    let h = harness(3).await;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let intervals = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..9 {
        let manager = h.manager.clone();
        let sequence = CommandSequence::builder(format!("https://site-{}.org", i))
            .step(Arc::new(Tracked {
                sleep: Duration::from_millis(30),
                running: running.clone(),
                peak: peak.clone(),
                intervals: intervals.clone(),
            }))
            .build()
            .unwrap();
        handles.push(tokio::spawn(async move {
            manager.submit(sequence, RoutingKey::AnyIdle).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(results.len(), 9);
    assert!(peak.load(Ordering::SeqCst) <= 3);

    // Sequences on the same worker never overlap in time
    let intervals = intervals.lock().unwrap().clone();
    for worker in 0..3 {
        let sites: HashSet<Site> = results
            .iter()
            .filter(|r| r.worker_id == WorkerId(worker))
            .map(|r| r.site.clone())
            .collect();
        let mut spans: Vec<(Instant, Instant)> = intervals
            .iter()
            .filter(|(site, _, _)| sites.contains(site))
            .map(|(_, start, end)| (*start, *end))
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping sequences on worker {}", worker);
        }
    }
    assert_eq!(h.manager.snapshot().count(WorkerState::Idle), 3);
}

#[tokio::test]
async fn test_crash_mid_sequence_recovers_worker() {
    let h = harness(1).await;
    let sequence = h.sequence(
        "https://a.org",
        &[
            ("one", Behavior::Succeed),
            ("boom", Behavior::Crash),
            ("three", Behavior::Succeed),
        ],
    );

    let result = h
        .manager
        .submit(sequence, RoutingKey::AnyIdle)
        .await
        .unwrap();

    assert_eq!(result.outcome(0), Some(&StepOutcome::Ok));
    assert!(matches!(result.outcome(1), Some(StepOutcome::Failed(_))));
    assert_eq!(result.outcome(2), Some(&StepOutcome::Abandoned));
    assert_eq!(result.overall, OverallOutcome::PartiallyCompleted);

    // Crashed -> Relaunching -> Idle with a fresh, clean browser
    assert_eq!(h.launcher.launches(WorkerId(0)), 2);
    assert_eq!(h.launcher.terminations(WorkerId(0)), 1);
    assert_eq!(
        h.manager.snapshot().get(WorkerId(0)).unwrap().state,
        WorkerState::Idle
    );
    assert_eq!(
        h.manager
            .metrics()
            .relaunches_total
            .with_label_values(&["default", "ok"])
            .get(),
        1
    );

    let next = h.sequence("https://b.org", &[("visit", Behavior::Succeed)]);
    let result = h.manager.submit(next, RoutingKey::AnyIdle).await.unwrap();
    assert_eq!(result.overall, OverallOutcome::Completed);

    // The capture of the step before the crash is still there
    assert_eq!(
        h.sink
            .records_for(&Site::new("https://a.org"), WorkerId(0))
            .len(),
        1
    );
}

#[tokio::test]
async fn test_panicking_step_keeps_worker_in_pool() {
    let h = harness(1).await;
    let sequence = h.sequence(
        "https://a.org",
        &[("boom", Behavior::Panic), ("two", Behavior::Succeed)],
    );

    let result = h
        .manager
        .submit(sequence, RoutingKey::AnyIdle)
        .await
        .unwrap();

    assert!(matches!(
        result.outcome(0),
        Some(StepOutcome::Failed(reason)) if reason.starts_with("step panicked")
    ));
    assert_eq!(result.outcome(1), Some(&StepOutcome::Abandoned));
    assert_eq!(h.launcher.launches(WorkerId(0)), 2);

    // The only worker must still take AnyIdle work
    let next = h.sequence("https://b.org", &[("visit", Behavior::Succeed)]);
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.manager.submit(next, RoutingKey::AnyIdle),
    )
    .await
    .expect("submit should not hang")
    .unwrap();
    assert_eq!(result.overall, OverallOutcome::Completed);
    assert_eq!(h.manager.snapshot().count(WorkerState::Idle), 1);
}

#[tokio::test]
async fn test_failed_relaunch_retires_worker_for_good() {
    let h = harness(2).await;
    h.launcher.refuse_launch(WorkerId(0));
    let crash = h.sequence("https://a.org", &[("boom", Behavior::Crash)]);

    h.manager
        .submit(crash, RoutingKey::Specific(WorkerId(0)))
        .await
        .unwrap();

    assert_eq!(
        h.manager.snapshot().get(WorkerId(0)).unwrap().state,
        WorkerState::Crashed
    );
    let retry = h.sequence("https://a.org", &[("visit", Behavior::Succeed)]);
    assert_eq!(
        h.manager
            .submit(retry.clone(), RoutingKey::Specific(WorkerId(0)))
            .await
            .unwrap_err(),
        DispatchError::Route(RouteError::WorkerCrashed(WorkerId(0)))
    );

    for _ in 0..3 {
        let result = h
            .manager
            .submit(retry.clone(), RoutingKey::AnyIdle)
            .await
            .unwrap();
        assert_eq!(result.worker_id, WorkerId(1));
    }
}

#[tokio::test]
async fn test_exhausted_pool_fails_waiters() {
    let h = harness(1).await;
    h.launcher.refuse_launch(WorkerId(0));
    let crash = h.sequence(
        "https://a.org",
        &[
            ("wait", Behavior::Sleep(Duration::from_millis(100))),
            ("boom", Behavior::Crash),
        ],
    );
    let running = h
        .manager
        .dispatch(crash, RoutingKey::AnyIdle, SubmitOptions::default())
        .await
        .unwrap();

    let queued = h.sequence("https://b.org", &[("visit", Behavior::Succeed)]);
    let err = h
        .manager
        .submit(queued.clone(), RoutingKey::AnyIdle)
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::PoolExhausted);

    let results = running.wait().await;
    assert_eq!(results[0].outcome(0), Some(&StepOutcome::Ok));
    assert_eq!(
        h.manager.submit(queued, RoutingKey::AnyIdle).await.unwrap_err(),
        DispatchError::PoolExhausted
    );
}

#[tokio::test]
async fn test_single_worker_serializes_any_idle_submissions() {
    let h = harness(1).await;
    let first = h.sequence("https://a.org", &[("a", Behavior::Sleep(Duration::from_millis(100)))]);
    let second = h.sequence("https://b.org", &[("b", Behavior::Sleep(Duration::from_millis(100)))]);

    let start = Instant::now();
    let (a, b) = tokio::join!(
        h.manager.submit(first, RoutingKey::AnyIdle),
        h.manager.submit(second, RoutingKey::AnyIdle),
    );

    assert_eq!(a.unwrap().overall, OverallOutcome::Completed);
    assert_eq!(b.unwrap().overall, OverallOutcome::Completed);
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(h.log.names().len(), 2);
}

#[tokio::test]
async fn test_shutdown_fails_queued_and_finishes_running() {
    let h = harness(1).await;
    let slow = h.sequence("https://slow.org", &[("slow", Behavior::Sleep(Duration::from_millis(150)))]);
    let running = h
        .manager
        .dispatch(slow, RoutingKey::AnyIdle, SubmitOptions::default())
        .await
        .unwrap();

    let manager = h.manager.clone();
    let queued = h.sequence("https://b.org", &[("visit", Behavior::Succeed)]);
    let waiter = tokio::spawn(async move { manager.submit(queued, RoutingKey::AnyIdle).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.manager.shutdown(Duration::from_secs(2)).await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap_err(), DispatchError::ShuttingDown);
    let results = running.wait().await;
    assert_eq!(results[0].overall, OverallOutcome::Completed);
    assert_eq!(h.launcher.terminations(WorkerId(0)), 1);
    assert_eq!(h.log.names(), vec!["slow"]);
}
