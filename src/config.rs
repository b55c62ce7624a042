/// config.rs – Load settings from config.yaml + environment variables.
///
/// Environment variables always override YAML values.
/// The user id and API token are read exclusively from the environment / .env file.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::{BackoffStrategy, ReconnectPolicy};

/// Bounds for every seconds-valued timing setting.
const MIN_INTERVAL_SECS: f64 = 0.001;
const MAX_INTERVAL_SECS: f64 = 86_400.0;

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    /// Log destination while the dashboard owns the terminal.
    pub log_file: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".into(),
            log_file: "tradedesk.log".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 = retry forever.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            strategy: self.strategy,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Push-update WebSocket endpoint.
    pub url: String,
    /// Keep-alive ping cadence while the connection is open.
    pub ping_interval_seconds: f64,
    /// Capacity of the dashboard's inbound update queue.
    pub channel_capacity: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3001/ws".into(),
            ping_interval_seconds: 30.0,
            channel_capacity: 512,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl FeedConfig {
    pub fn ping_interval(&self) -> Duration {
        secs_to_duration(self.ping_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// REST base URL, e.g. `http://localhost:3001/api`. Unset skips the snapshot fetch.
    pub base_url: Option<String>,
    pub timeout_seconds: f64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_seconds)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_seconds: 15.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Dashboard refresh rate in seconds.
    pub refresh_rate: f64,
    /// Symbols whose market data channels are subscribed.
    pub symbols: Vec<String>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            refresh_rate: 1.0,
            symbols: vec!["AAPL".into(), "MSFT".into(), "NVDA".into(), "SPY".into()],
        }
    }
}

impl DashboardConfig {
    pub fn refresh_interval(&self) -> Duration {
        secs_to_duration(self.refresh_rate)
    }
}

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppConfig,
    pub feed: FeedConfig,
    pub api: ApiConfig,
    pub dashboard: DashboardConfig,

    // Populated from env, not from YAML.
    #[serde(skip)]
    pub user_id: Option<String>,
    #[serde(skip)]
    pub api_token: Option<String>,
}

impl Settings {
    /// Load settings from *config_path* YAML file, then overlay env vars.
    pub fn load(config_path: &str, feed_url_override: Option<String>) -> Result<Self> {
        // Try to load .env file (ignore error if absent)
        let _ = dotenvy::dotenv();

        let mut settings = Self::from_file(config_path)?;

        if let Ok(url) = std::env::var("TRADEDESK_FEED_URL") {
            settings.feed.url = url;
        }
        if let Ok(url) = std::env::var("TRADEDESK_API_URL") {
            settings.api.base_url = Some(url);
        }
        settings.user_id = non_empty_env("TRADEDESK_USER_ID");
        settings.api_token = non_empty_env("TRADEDESK_API_TOKEN");

        if let Some(url) = feed_url_override {
            settings.feed.url = url;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// YAML file only; a missing file yields the defaults.
    pub fn from_file(config_path: &str) -> Result<Self> {
        if !std::path::Path::new(config_path).exists() {
            return Ok(Settings::default());
        }
        let yaml = std::fs::read_to_string(config_path).context("reading config file")?;
        serde_yaml::from_str::<Settings>(&yaml).context("parsing config YAML")
    }

    pub fn validate(&self) -> Result<()> {
        validate_interval("feed.ping_interval_seconds", self.feed.ping_interval_seconds)?;
        validate_interval("dashboard.refresh_rate", self.dashboard.refresh_rate)?;
        validate_interval("api.timeout_seconds", self.api.timeout_seconds)?;

        let url = self.feed.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            bail!("feed.url must start with ws:// or wss:// (got '{url}')");
        }
        if self.feed.channel_capacity == 0 {
            bail!("feed.channel_capacity must be > 0");
        }
        if self.feed.reconnect.base_delay_ms == 0 {
            bail!("feed.reconnect.base_delay_ms must be > 0");
        }
        if self.feed.reconnect.max_delay_ms < self.feed.reconnect.base_delay_ms {
            bail!("feed.reconnect.max_delay_ms must be >= base_delay_ms");
        }
        if let Some(api) = &self.api.base_url {
            if !(api.starts_with("http://") || api.starts_with("https://")) {
                bail!("api.base_url must start with http:// or https:// (got '{api}')");
            }
        }
        if self
            .dashboard
            .symbols
            .iter()
            .any(|s| s.trim().is_empty() || s.len() > 16)
        {
            bail!("dashboard.symbols entries must be non-empty and <= 16 chars");
        }
        if self.app.log_file.trim().is_empty() {
            bail!("app.log_file must not be empty");
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn validate_interval(name: &str, value: f64) -> Result<()> {
    if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&value) {
        bail!("{name} must be between {MIN_INTERVAL_SECS} and {MAX_INTERVAL_SECS} seconds (got {value})");
    }
    Ok(())
}

/// Clamped into the accepted range so an unvalidated value can never yield a
/// zero period or overflow the conversion. NaN maps to the minimum.
fn secs_to_duration(secs: f64) -> Duration {
    let secs = if secs.is_nan() {
        MIN_INTERVAL_SECS
    } else {
        secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS)
    };
    Duration::from_secs_f64(secs)
}
