//! Configuration loader and validator for the marketplace monitor.
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
    pub search: Search,
    pub source: Source,
    pub monitor: Monitor,
    pub telegram: Telegram,
    pub notify: Notify,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Marketplace search criteria applied on every poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Search {
    pub keywords: Vec<String>,
    pub location: String,
    pub radius_miles: u32,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub categories: Vec<String>,
}

/// Listing-source service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

/// Scheduling, retry and retention behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Monitor {
    pub check_interval_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub retention_days: i64,
    pub max_listings_per_check: usize,
    pub stop_grace_secs: u64,
}

/// Telegram delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub chat_id: i64,
}

/// Notification dispatch policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notify {
    pub min_gap_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub send_timeout_secs: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL for the seen store, honoring a `DATABASE_URL` override.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/marketwatch.db", self.app.data_dir))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.check_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.monitor.retry_delay_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.monitor.stop_grace_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.monitor.retention_days)
    }
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
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.search.keywords.iter().all(|k| k.trim().is_empty()) {
        return Err(ConfigError::Invalid(
            "search.keywords must contain at least one keyword",
        ));
    }
    if let (Some(min), Some(max)) = (cfg.search.min_price, cfg.search.max_price) {
        if min > max {
            return Err(ConfigError::Invalid(
                "search.min_price must not exceed search.max_price",
            ));
        }
    }

    if cfg.source.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("source.base_url must be non-empty"));
    }
    if cfg.source.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "source.request_timeout_secs must be > 0",
        ));
    }

    if cfg.monitor.check_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "monitor.check_interval_secs must be > 0",
        ));
    }
    if cfg.monitor.max_retries == 0 {
        return Err(ConfigError::Invalid("monitor.max_retries must be > 0"));
    }
    if cfg.monitor.retention_days <= 0 {
        return Err(ConfigError::Invalid("monitor.retention_days must be > 0"));
    }
    if cfg.monitor.max_listings_per_check == 0 {
        return Err(ConfigError::Invalid(
            "monitor.max_listings_per_check must be > 0",
        ));
    }
    if cfg.monitor.stop_grace_secs == 0 {
        return Err(ConfigError::Invalid("monitor.stop_grace_secs must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.chat_id == 0 {
        return Err(ConfigError::Invalid("telegram.chat_id must be non-zero"));
    }

    if cfg.notify.max_attempts == 0 {
        return Err(ConfigError::Invalid("notify.max_attempts must be > 0"));
    }
    if cfg.notify.send_timeout_secs == 0 {
        return Err(ConfigError::Invalid("notify.send_timeout_secs must be > 0"));
    }

    Ok(())
}

/// Example YAML document with every recognized option.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

search:
  keywords:
    - "iphone 14"
    - "pixel 8"
  location: "Denver, CO"
  radius_miles: 40
  min_price: 100
  max_price: 800
  categories:
    - "electronics"

source:
  base_url: "http://127.0.0.1:8080"
  request_timeout_secs: 30

monitor:
  check_interval_secs: 300
  max_retries: 3
  retry_delay_secs: 60
  retention_days: 7
  max_listings_per_check: 20
  stop_grace_secs: 120

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  chat_id: 123456789

notify:
  min_gap_ms: 1000
  max_attempts: 3
  retry_delay_secs: 5
  send_timeout_secs: 10
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_empty_keywords() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.search.keywords = vec!["   ".into()];
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("search.keywords")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_price_bounds() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.search.min_price = Some(900);
        cfg.search.max_price = Some(100);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_scheduling_values() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.monitor.check_interval_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.monitor.max_retries = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.monitor.retention_days = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.notify.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.telegram.chat_id, 123456789);
        assert_eq!(cfg.monitor.retention_days, 7);
    }
}
