use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Browser launch and instrumentation settings, shared by every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserParams {
    /// true = headless (faster, detectable), false = headfull
    pub headless: bool,
    /// Path to browser binary. If None, uses default Chrome/Chromium auto-detection.
    pub browser_path: Option<PathBuf>,
    /// Record the requests made by every visited page
    pub http_instrument: bool,
    /// Attach the cookie jar to every page capture
    pub cookie_instrument: bool,
    /// Profile directory the first browser of each worker starts from.
    /// Relaunched browsers always start clean.
    pub seed_profile: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub launch_timeout: Duration,
    /// Chrome kills itself after this long without CDP traffic
    #[serde(with = "humantime_serde")]
    pub idle_browser_timeout: Duration,
}

impl Default for BrowserParams {
    fn default() -> Self {
        Self {
            headless: true,
            browser_path: None,
            http_instrument: true,
            cookie_instrument: true,
            seed_profile: None,
            launch_timeout: Duration::from_secs(60),
            idle_browser_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerParams {
    /// Label attached to every metric of this pool
    pub pool_name: String,
    /// Number of workers (browsers); fixed for the lifetime of the pool
    pub pool_size: usize,
    pub data_directory: PathBuf,
    /// Where the crawl binary writes `crawl-hive.log`
    pub log_directory: PathBuf,
    /// How long shutdown waits for busy workers
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Consecutive step failures treated like a timeout
    pub max_consecutive_failures: u32,
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub liveness_probe_timeout: Duration,
    pub sink_retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub sink_retry_backoff: Duration,
}

impl Default for ManagerParams {
    fn default() -> Self {
        Self {
            pool_name: "default".to_string(),
            pool_size: 1,
            data_directory: PathBuf::from("./data/"),
            log_directory: PathBuf::from("./data/"),
            shutdown_grace: Duration::from_secs(60),
            max_consecutive_failures: 3,
            reset_timeout: Duration::from_secs(30),
            liveness_probe_timeout: Duration::from_secs(5),
            sink_retry_attempts: 3,
            sink_retry_backoff: Duration::from_millis(200),
        }
    }
}

impl ManagerParams {
    pub fn log_file(&self) -> PathBuf {
        self.log_directory.join("crawl-hive.log")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub manager: ManagerParams,
    pub browser: BrowserParams,
}

impl EngineConfig {
    /// Build the configuration from `CRAWL_*` environment variables.
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = EngineConfig::default();

        let manager = ManagerParams {
            pool_name: env::var("CRAWL_POOL_NAME").unwrap_or(defaults.manager.pool_name),
            pool_size: env_parse("CRAWL_POOL_SIZE").unwrap_or(defaults.manager.pool_size),
            data_directory: env::var("CRAWL_DATA_DIR")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(defaults.manager.data_directory),
            log_directory: env::var("CRAWL_LOG_DIR")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(defaults.manager.log_directory),
            shutdown_grace: env_secs("CRAWL_SHUTDOWN_GRACE_SECS")
                .unwrap_or(defaults.manager.shutdown_grace),
            max_consecutive_failures: env_parse("CRAWL_MAX_CONSECUTIVE_FAILURES")
                .unwrap_or(defaults.manager.max_consecutive_failures),
            reset_timeout: env_secs("CRAWL_RESET_TIMEOUT_SECS")
                .unwrap_or(defaults.manager.reset_timeout),
            liveness_probe_timeout: env_secs("CRAWL_LIVENESS_TIMEOUT_SECS")
                .unwrap_or(defaults.manager.liveness_probe_timeout),
            sink_retry_attempts: env_parse("CRAWL_SINK_RETRY_ATTEMPTS")
                .unwrap_or(defaults.manager.sink_retry_attempts),
            sink_retry_backoff: env_parse::<u64>("CRAWL_SINK_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.manager.sink_retry_backoff),
        };

        let browser = BrowserParams {
            headless: env_parse("CRAWL_HEADLESS").unwrap_or(defaults.browser.headless),
            browser_path: env::var("CRAWL_BROWSER_PATH").ok().map(PathBuf::from),
            http_instrument: env_parse("CRAWL_HTTP_INSTRUMENT")
                .unwrap_or(defaults.browser.http_instrument),
            cookie_instrument: env_parse("CRAWL_COOKIE_INSTRUMENT")
                .unwrap_or(defaults.browser.cookie_instrument),
            seed_profile: env::var("CRAWL_SEED_PROFILE").ok().map(PathBuf::from),
            launch_timeout: env_secs("CRAWL_LAUNCH_TIMEOUT_SECS")
                .unwrap_or(defaults.browser.launch_timeout),
            idle_browser_timeout: env_secs("CRAWL_IDLE_BROWSER_TIMEOUT_SECS")
                .unwrap_or(defaults.browser.idle_browser_timeout),
        };

        let config = EngineConfig { manager, browser };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.manager.pool_size == 0 {
            anyhow::bail!("pool_size must be at least 1");
        }
        if self.manager.max_consecutive_failures == 0 {
            anyhow::bail!("max_consecutive_failures must be at least 1");
        }
        if self.manager.reset_timeout.is_zero() || self.browser.launch_timeout.is_zero() {
            anyhow::bail!("reset_timeout and launch_timeout must be non-zero");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_crawl_script() {
        let config = EngineConfig::default();
        assert_eq!(config.manager.pool_size, 1);
        assert_eq!(config.manager.data_directory, PathBuf::from("./data/"));
        assert_eq!(config.manager.max_consecutive_failures, 3);
        assert!(config.browser.headless);
        assert!(config.browser.http_instrument);
        assert!(config.browser.cookie_instrument);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_file_in_log_directory() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"manager": {"log_directory": "/var/log/crawl"}}"#).unwrap();
        assert_eq!(
            config.manager.log_file(),
            PathBuf::from("/var/log/crawl/crawl-hive.log")
        );
        assert_eq!(
            config.manager.data_directory,
            ManagerParams::default().data_directory
        );
    }

    #[test]
    fn test_humantime_durations() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"manager": {"pool_size": 4, "shutdown_grace": "2m 30s"},
                "browser": {"headless": false, "launch_timeout": "90s"}}"#,
        )
        .unwrap();

        assert_eq!(config.manager.pool_size, 4);
        assert_eq!(config.manager.shutdown_grace, Duration::from_secs(150));
        assert_eq!(config.manager.reset_timeout, Duration::from_secs(30));
        assert!(!config.browser.headless);
        assert_eq!(config.browser.launch_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut config = EngineConfig::default();
        config.manager.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
