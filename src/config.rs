//! Configuration loader and validator for the scrape orchestrator.
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub scraper: Scraper,
    pub scheduler: Scheduler,
    pub inference: Inference,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Rendering pool and per-job limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scraper {
    pub max_concurrent_scrapers: usize,
    pub max_instances: usize,
    pub contexts_per_instance: usize,
    pub page_timeout_ms: u64,
    pub acquire_timeout_secs: u64,
    pub job_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
    pub max_idle_secs: u64,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub chromium_path: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Scheduler triggers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub timezone: String,
    /// Wall-clock time of the daily full sweep, `HH:MM` (24-hour).
    pub daily_scrape_time: String,
    pub log_retention_days: u32,
    pub shutdown_grace_secs: u64,
}

/// Completion service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inference {
    pub base_url: String,
    pub model: String,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins, then `app.database_url`, then a file under `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}/tender-scout.db",
                    self.app.data_dir.trim_end_matches('/')
                )
            })
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        parse_timezone(&self.scheduler.timezone)
    }

    pub fn daily_scrape_time(&self) -> Result<NaiveTime, ConfigError> {
        parse_hh_mm(&self.scheduler.daily_scrape_time)
    }
}

impl Scraper {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

impl Inference {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::Invalid("scheduler.timezone must be an IANA zone name"))
}

fn parse_hh_mm(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| ConfigError::Invalid("scheduler.daily_scrape_time must be HH:MM (24-hour)"))
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let s = &cfg.scraper;
    if s.max_concurrent_scrapers == 0 {
        return Err(ConfigError::Invalid("scraper.max_concurrent_scrapers must be > 0"));
    }
    if s.max_instances == 0 {
        return Err(ConfigError::Invalid("scraper.max_instances must be > 0"));
    }
    if s.contexts_per_instance == 0 {
        return Err(ConfigError::Invalid("scraper.contexts_per_instance must be > 0"));
    }
    if s.page_timeout_ms == 0 {
        return Err(ConfigError::Invalid("scraper.page_timeout_ms must be > 0"));
    }
    if s.job_timeout_secs == 0 {
        return Err(ConfigError::Invalid("scraper.job_timeout_secs must be > 0"));
    }
    if s.maintenance_interval_secs == 0 {
        return Err(ConfigError::Invalid("scraper.maintenance_interval_secs must be > 0"));
    }

    parse_timezone(&cfg.scheduler.timezone)?;
    parse_hh_mm(&cfg.scheduler.daily_scrape_time)?;
    if cfg.scheduler.log_retention_days == 0 {
        return Err(ConfigError::Invalid("scheduler.log_retention_days must be > 0"));
    }

    if cfg.inference.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("inference.base_url must be non-empty"));
    }
    if cfg.inference.model.trim().is_empty() {
        return Err(ConfigError::Invalid("inference.model must be non-empty"));
    }
    if cfg.inference.max_attempts == 0 {
        return Err(ConfigError::Invalid("inference.max_attempts must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML content shipped with the project.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

scraper:
  max_concurrent_scrapers: 3
  max_instances: 3
  contexts_per_instance: 5
  page_timeout_ms: 30000
  acquire_timeout_secs: 30
  job_timeout_secs: 180
  maintenance_interval_secs: 300
  max_idle_secs: 300
  headless: true

scheduler:
  timezone: "Asia/Kolkata"
  daily_scrape_time: "08:00"
  log_retention_days: 30
  shutdown_grace_secs: 30

inference:
  base_url: "http://localhost:11434"
  model: "llama2"
  max_attempts: 3
  retry_base_delay_ms: 2000
  request_timeout_secs: 60
"#
}
