// Crawl binary: visits every site of a site list with the pool of browsers
//
// Each site gets a fresh profile, a browse of up to 5 in-domain links and a
// cookie dump. Captures land in JSON-lines files under the data directory.

use anyhow::{Context, Result};
use crawl_hive_common::{
    CommandSequence, DispatchError, EngineConfig, ExecutionResult, JsonlSink, RoutingKey,
};
use crawl_hive_dispatcher::{CancellationToken, SubmitOptions, TaskManager};
use crawl_hive_worker::ChromeLauncher;
use std::env;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_SITE_LIST: &str = "municipalities_final_urls.txt";
const BROWSE_MAX_LINKS: u32 = 5;
const BROWSE_SLEEP: Duration = Duration::from_secs(10);
const BROWSE_TIMEOUT: Duration = Duration::from_secs(360);
const DUMP_COOKIES_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_env()?;

    // Initialize tracing: stdout plus a log file in the log directory
    let level = env::var("CRAWL_LOG_LEVEL")
        .ok()
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let log_file = open_log_file(&config.manager.log_file())?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(std::io::stdout.and(Mutex::new(log_file)))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    info!("Logging to {}", config.manager.log_file().display());
    let site_list = env::var("CRAWL_SITE_LIST").unwrap_or_else(|_| DEFAULT_SITE_LIST.to_string());
    // Same as the `**` index of crawl scripts: every browser visits every site
    let routing: RoutingKey = env::var("CRAWL_ROUTING")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(RoutingKey::Broadcast);

    let sites = read_site_list(Path::new(&site_list)).await?;
    info!(
        "Loaded {} site(s) from {}, routing: {:?}",
        sites.len(),
        site_list,
        routing
    );

    let sink = Arc::new(JsonlSink::open(&config.manager.data_directory).await?);
    let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));
    let manager = Arc::new(TaskManager::launch(config.clone(), launcher, sink).await?);

    if let Some(port) = env::var("CRAWL_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
    {
        let metrics = manager.metrics();
        tokio::spawn(async move {
            if let Err(e) = metrics.start_server(port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let stop = CancellationToken::new();
    tokio::spawn(shutdown_signal(stop.clone()));

    let mut running: JoinSet<Vec<ExecutionResult>> = JoinSet::new();
    let mut submitted = 0usize;

    for site in &sites {
        if stop.is_cancelled() {
            warn!("Stopping submission, {} site(s) not crawled", sites.len() - submitted);
            break;
        }

        let sequence = CommandSequence::builder(site.as_str())
            .reset(true)
            .browse(BROWSE_MAX_LINKS, BROWSE_SLEEP, BROWSE_TIMEOUT)
            .dump_profile_cookies(DUMP_COOKIES_TIMEOUT)
            .build()?;
        let options = SubmitOptions {
            cancellation: Some(stop.clone()),
            ..Default::default()
        };

        // A broadcast only reaches idle workers, so wait for the previous
        // site to finish everywhere before sending the next one
        let outcome = if routing == RoutingKey::Broadcast {
            manager
                .execute_with(sequence, routing, options)
                .await
                .map(log_results)
        } else {
            manager
                .dispatch(sequence, routing, options)
                .await
                .map(|pending| {
                    running.spawn(pending.wait());
                })
        };

        match outcome {
            Ok(()) => submitted += 1,
            Err(DispatchError::Cancelled) | Err(DispatchError::ShuttingDown) => break,
            Err(DispatchError::PoolExhausted) => {
                error!("Every browser has crashed, giving up");
                break;
            }
            Err(e) => warn!("Could not submit {}: {}", site, e),
        }
    }

    while let Some(joined) = running.join_next().await {
        match joined {
            Ok(results) => log_results(results),
            Err(e) => error!("Result task failed: {}", e),
        }
    }

    info!("Submitted {}/{} site(s)", submitted, sites.len());
    manager.shutdown(config.manager.shutdown_grace).await
}

fn log_results(results: Vec<ExecutionResult>) {
    for result in results {
        info!(
            worker_id = %result.worker_id,
            "{}: {}",
            result.site,
            result.overall.as_str()
        );
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// One site per line; blank lines and `#` comments are skipped
async fn read_site_list(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read site list {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

async fn shutdown_signal(stop: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            warn!("Received SIGTERM signal");
        },
    }

    info!("Cancelling submissions, running sequences will finish");
    stop.cancel();
}
