//! Configuration loader and validator for the feed synchronization engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::model::{Source, SourceCatalog};

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
    pub backend: Backend,
    pub sources: Vec<SourceEntry>,
    pub metrics: Metrics,
    pub refresh: Refresh,
    pub notifications: Notifications,
}

/// Buffer and paging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub page_size: usize,
    pub max_buffer_size: usize,
    pub request_timeout_ms: u64,
}

/// Feed backend endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backend {
    pub base_url: String,
    pub token: String,
}

/// One upstream feed merged into the view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceEntry {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metrics {
    pub batch_size: usize,
}

/// Refresh job submission and polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Refresh {
    pub initial_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub max_poll_budget_ms: u64,
    pub submit_retries: u32,
    pub poll_failure_retries: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPolicy {
    /// New entries stay staged until the user accepts them.
    #[default]
    ExplicitAccept,
    /// New entries are merged on arrival; the banner only informs.
    AutoMerge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    #[serde(default)]
    pub policy: NotificationPolicy,
    pub preview_count: usize,
    pub display_timeout_ms: u64,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.app.request_timeout_ms)
    }

    pub fn poll_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.refresh.initial_poll_interval_ms),
            Duration::from_millis(self.refresh.max_poll_interval_ms),
        )
    }

    pub fn poll_budget(&self) -> Duration {
        Duration::from_millis(self.refresh.max_poll_budget_ms)
    }

    pub fn display_timeout(&self) -> Duration {
        Duration::from_millis(self.notifications.display_timeout_ms)
    }

    /// The configured sources as a fully known catalog.
    pub fn source_catalog(&self) -> SourceCatalog {
        let sources = self
            .sources
            .iter()
            .map(|s| Source {
                id: s.id.clone(),
                title: s.title.clone(),
            })
            .collect();
        SourceCatalog::new(sources, true)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `feed-sync.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("feed-sync.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.page_size == 0 {
        return Err(ConfigError::Invalid("app.page_size must be > 0"));
    }
    if cfg.app.max_buffer_size < cfg.app.page_size {
        return Err(ConfigError::Invalid("app.max_buffer_size must be >= app.page_size"));
    }
    if cfg.app.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_ms must be > 0"));
    }

    if cfg.backend.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.base_url must be non-empty"));
    }
    if !cfg.backend.base_url.ends_with('/') {
        return Err(ConfigError::Invalid("backend.base_url must end with '/'"));
    }
    if cfg.backend.token.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.token must be non-empty"));
    }

    if cfg.sources.is_empty() {
        return Err(ConfigError::Invalid("sources must list at least one source"));
    }
    if cfg.sources.iter().any(|s| s.id.trim().is_empty()) {
        return Err(ConfigError::Invalid("sources[].id must be non-empty"));
    }

    if cfg.metrics.batch_size == 0 {
        return Err(ConfigError::Invalid("metrics.batch_size must be > 0"));
    }

    let r = &cfg.refresh;
    if r.initial_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("refresh.initial_poll_interval_ms must be > 0"));
    }
    if r.max_poll_interval_ms < r.initial_poll_interval_ms {
        return Err(ConfigError::Invalid(
            "refresh.max_poll_interval_ms must be >= refresh.initial_poll_interval_ms",
        ));
    }
    if r.max_poll_budget_ms < r.initial_poll_interval_ms {
        return Err(ConfigError::Invalid(
            "refresh.max_poll_budget_ms must be >= refresh.initial_poll_interval_ms",
        ));
    }

    if cfg.notifications.display_timeout_ms == 0 {
        return Err(ConfigError::Invalid("notifications.display_timeout_ms must be > 0"));
    }

    Ok(())
}

/// Returns the canonical example YAML.
pub fn example() -> &'static str {
    r#"app:
  page_size: 30
  max_buffer_size: 600
  request_timeout_ms: 10000

backend:
  base_url: "https://feeds.example.com/"
  token: "YOUR_FEED_API_TOKEN"

sources:
  - id: "news"
    title: "Newsroom"
  - id: "eng-blog"
  - id: "status"
    title: "Status updates"

metrics:
  batch_size: 50

refresh:
  initial_poll_interval_ms: 1000
  max_poll_interval_ms: 30000
  max_poll_budget_ms: 120000
  submit_retries: 3
  poll_failure_retries: 3

notifications:
  policy: explicit_accept
  preview_count: 3
  display_timeout_ms: 15000
"#
}
