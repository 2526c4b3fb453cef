//! TOML configuration for the recommendation trigger service.
//!
//! Layered: an explicit `--config` path, else the file named by
//! `APPLY_RECOMMENDATIONS_CONFIG`, else `/etc/apply-recommendations/config.toml`,
//! else compiled-in defaults. `APPLY_RECOMMENDATIONS_TRIGGER_*` environment
//! variables override the trigger section afterwards.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "APPLY_RECOMMENDATIONS_";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "APPLY_RECOMMENDATIONS_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/apply-recommendations/config.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub content_server: ContentServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the file layer. Any file that is named or present must load;
    /// defaults apply only when no file is found at all.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&env_path))
                .with_context(|| format!("{CONFIG_ENV} is set but the file could not be loaded"));
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            return Self::load(system_path);
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// File layer, then process environment, then validation.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::load_or_default(explicit)?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `APPLY_RECOMMENDATIONS_TRIGGER_*` overrides using `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("TRIGGER_METHOD") {
            self.trigger.method = match v.trim() {
                "timer" => TriggerMethod::Timer,
                "http_request" => TriggerMethod::HttpRequest,
                "both" => TriggerMethod::Both,
                other => bail!("{ENV_PREFIX}TRIGGER_METHOD: unknown trigger method '{other}'"),
            };
        }
        if let Some(v) = var("TRIGGER_RUN_INTERVAL") {
            self.trigger.run_interval_sec = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PREFIX}TRIGGER_RUN_INTERVAL: not a number of seconds: '{v}'"))?;
        }
        if let Some(v) = var("TRIGGER_HTTP_ADDRESS") {
            self.trigger.http_address = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PREFIX}TRIGGER_HTTP_ADDRESS: not an IP address: '{v}'"))?;
        }
        if let Some(v) = var("TRIGGER_HTTP_PORT") {
            self.trigger.http_port = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PREFIX}TRIGGER_HTTP_PORT: not a port: '{v}'"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.trigger.run_interval_sec == 0 {
            bail!("trigger.run_interval_sec must be greater than zero");
        }
        if self.trigger.http_port == 0 {
            bail!("trigger.http_port must be between 1 and 65535");
        }
        if self.window.checked_min_window().is_none() {
            bail!("window.min_window_sec is out of range");
        }
        if self.evaluator.timeout_sec == 0 {
            bail!("evaluator.timeout_sec must be greater than zero");
        }
        if self.content_server.max_attempts == 0 {
            bail!("content_server.max_attempts must be at least 1");
        }
        if self.storage.db_path.as_os_str().is_empty() {
            bail!("storage.db_path must not be empty");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Which trigger sources feed the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMethod {
    /// Fixed-interval timer only.
    Timer,
    /// Inbound HTTP POST only.
    HttpRequest,
    /// Timer and HTTP listener together.
    Both,
}

impl TriggerMethod {
    pub fn uses_timer(&self) -> bool {
        matches!(self, TriggerMethod::Timer | TriggerMethod::Both)
    }

    pub fn uses_http(&self) -> bool {
        matches!(self, TriggerMethod::HttpRequest | TriggerMethod::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub method: TriggerMethod,
    /// Seconds between timer ticks.
    pub run_interval_sec: u64,
    /// Listen address for the HTTP trigger.
    pub http_address: IpAddr,
    pub http_port: u16,
}

impl TriggerConfig {
    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_sec)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http_address, self.http_port)
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            method: TriggerMethod::HttpRequest,
            run_interval_sec: 300,
            http_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http_port: 12345,
        }
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// No data before this instant is ever evaluated. RFC 3339.
    pub global_start: DateTime<Utc>,
    /// Smallest window a fresh run may cover.
    pub min_window_sec: u64,
}

impl WindowConfig {
    /// `None` when `min_window_sec` does not fit a `chrono::Duration`.
    pub fn checked_min_window(&self) -> Option<chrono::Duration> {
        i64::try_from(self.min_window_sec)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    /// Out-of-range values are rejected by [`Config::validate`]; this saturates.
    pub fn min_window(&self) -> chrono::Duration {
        self.checked_min_window().unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            global_start: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            min_window_sec: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    /// Spawn `command` once per window.
    Command,
    /// POST the window to `url`.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub kind: EvaluatorKind,
    pub command: Option<String>,
    /// `{start}` and `{end}` are replaced with the window bounds.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub url: Option<String>,
    /// Hard limit on one evaluation.
    pub timeout_sec: u64,
}

impl EvaluatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            kind: EvaluatorKind::Command,
            command: None,
            args: vec!["--start".to_string(), "{start}".to_string(), "--end".to_string(), "{end}".to_string()],
            working_dir: None,
            url: None,
            timeout_sec: 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// Content server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentServerConfig {
    /// Health endpoint polled before any run. Unset disables the gate.
    pub health_url: Option<String>,
    pub max_attempts: u32,
    pub retry_delay_sec: u64,
    pub request_timeout_sec: u64,
}

impl Default for ContentServerConfig {
    fn default() -> Self {
        Self {
            health_url: None,
            max_attempts: 30,
            retry_delay_sec: 10,
            request_timeout_sec: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file holding the run ledger.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/apply-recommendations.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
