use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use crawl_hive_common::{OverallOutcome, PoolSnapshot, StepOutcome, WorkerState};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

const WORKER_STATES: [WorkerState; 4] = [
    WorkerState::Idle,
    WorkerState::Busy,
    WorkerState::Crashed,
    WorkerState::Relaunching,
];

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pool_name: String,
    pub workers: IntGaugeVec,
    pub sequences_total: IntCounterVec,
    pub steps_total: IntCounterVec,
    pub relaunches_total: IntCounterVec,
    pub sink_failures_total: IntCounterVec,
}

impl Metrics {
    pub fn new(pool_name: &str) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        // Workers per lifecycle state
        let workers = IntGaugeVec::new(
            Opts::new(
                "crawl_hive_workers",
                "Number of workers in each lifecycle state",
            ),
            &["pool", "state"],
        )?;
        registry.register(Box::new(workers.clone()))?;

        let sequences_total = IntCounterVec::new(
            Opts::new(
                "crawl_hive_sequences_total",
                "Command sequences executed, by overall outcome",
            ),
            &["pool", "outcome"],
        )?;
        registry.register(Box::new(sequences_total.clone()))?;

        let steps_total = IntCounterVec::new(
            Opts::new(
                "crawl_hive_steps_total",
                "Sequence steps resolved, by outcome",
            ),
            &["pool", "outcome"],
        )?;
        registry.register(Box::new(steps_total.clone()))?;

        // Browser relaunches, successful or not
        let relaunches_total = IntCounterVec::new(
            Opts::new(
                "crawl_hive_relaunches_total",
                "Browser relaunches after a worker fault",
            ),
            &["pool", "result"],
        )?;
        registry.register(Box::new(relaunches_total.clone()))?;

        let sink_failures_total = IntCounterVec::new(
            Opts::new(
                "crawl_hive_sink_failures_total",
                "Captures lost after every sink retry failed",
            ),
            &["pool"],
        )?;
        registry.register(Box::new(sink_failures_total.clone()))?;

        for state in WORKER_STATES {
            workers.with_label_values(&[pool_name, state.as_str()]).set(0);
        }
        sink_failures_total.with_label_values(&[pool_name]);

        Ok(Self {
            registry,
            pool_name: pool_name.to_string(),
            workers,
            sequences_total,
            steps_total,
            relaunches_total,
            sink_failures_total,
        })
    }

    pub fn observe_pool(&self, snapshot: &PoolSnapshot) {
        for state in WORKER_STATES {
            self.workers
                .with_label_values(&[&self.pool_name, state.as_str()])
                .set(snapshot.count(state) as i64);
        }
    }

    pub fn observe_step(&self, outcome: &StepOutcome) {
        self.steps_total
            .with_label_values(&[&self.pool_name, outcome.label()])
            .inc();
    }

    pub fn observe_sequence(&self, outcome: OverallOutcome) {
        self.sequences_total
            .with_label_values(&[&self.pool_name, outcome.as_str()])
            .inc();
    }

    pub fn observe_relaunch(&self, succeeded: bool) {
        let result = if succeeded { "ok" } else { "failed" };
        self.relaunches_total
            .with_label_values(&[&self.pool_name, result])
            .inc();
    }

    pub fn observe_sink_failure(&self) {
        self.sink_failures_total
            .with_label_values(&[&self.pool_name])
            .inc();
    }

    /// Start HTTP server for Prometheus metrics on specified port
    pub async fn start_server(self, port: u16) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let app = app.with_state(self);

        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Metrics server listening on {}", addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Metrics>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}
