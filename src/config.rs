//! Layered configuration read from `conductor.toml`.
//!
//! Precedence is file → environment (`CONDUCTOR_*`) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! default_retry_count = 2
//! action_timeout_secs = 120
//! phase_timeout_secs = 900
//! retry_backoff_ms = 500
//! max_backoff_ms = 10000
//! history_capacity = 256
//! event_capacity = 256
//! rag_wait_secs = 30
//! gavel_timeout_secs = 0
//!
//! [state]
//! dir = ".conductor/runs"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! file = ".conductor/logs/conductor.log"
//!
//! [workers.drafter]
//! endpoint = "http://localhost:8080/generate"
//! display_name = "Drafter"
//! timeout_secs = 60
//!
//! [teams]
//! editors = ["drafter", "critic"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::worker::{HttpWorker, StaticRegistry};

pub const CONFIG_FILE: &str = "conductor.toml";

/// Engine tuning shared by every run of an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries per action when neither the action nor its phase sets one
    #[serde(default = "default_retry_count")]
    pub default_retry_count: u32,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Base delay of the exponential retry backoff
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Output history entries kept for audit
    #[serde(default = "default_capacity")]
    pub history_capacity: usize,
    /// Broadcast buffer for event subscribers
    #[serde(default = "default_capacity")]
    pub event_capacity: usize,
    /// Default bound on waiting for RAG fulfillment
    #[serde(default = "default_rag_wait_secs")]
    pub rag_wait_secs: u64,
    /// Interactive gavels auto-reject after this long; 0 waits forever
    #[serde(default)]
    pub gavel_timeout_secs: u64,
}

fn default_retry_count() -> u32 {
    2
}

fn default_action_timeout_secs() -> u64 {
    120
}

fn default_phase_timeout_secs() -> u64 {
    900
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_capacity() -> usize {
    256
}

fn default_rag_wait_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry_count: default_retry_count(),
            action_timeout_secs: default_action_timeout_secs(),
            phase_timeout_secs: default_phase_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            history_capacity: default_capacity(),
            event_capacity: default_capacity(),
            rag_wait_secs: default_rag_wait_secs(),
            gavel_timeout_secs: 0,
        }
    }
}

impl EngineConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn rag_wait(&self) -> Duration {
        Duration::from_secs(self.rag_wait_secs)
    }

    pub fn gavel_timeout(&self) -> Option<Duration> {
        (self.gavel_timeout_secs > 0).then(|| Duration::from_secs(self.gavel_timeout_secs))
    }

    /// Delay before retry `n` (0-based): `retry_backoff_ms * 2^n`, capped.
    pub fn backoff(&self, n: u32) -> Duration {
        let factor = 1u64.checked_shl(n.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".conductor/runs")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write logs to this file (daily rotation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// CLI flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub state_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub retry_count: Option<u32>,
}

/// Parsed `conductor.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,
    #[serde(default)]
    pub teams: BTreeMap<String, Vec<String>>,
}

impl ConductorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `./conductor.toml` when present, else the user-level file under the
    /// platform config directory.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join("conductor").join(CONFIG_FILE))
            .unwrap_or(local)
    }

    /// Load the file and apply environment and CLI overrides.
    pub fn resolve(path: &Path, cli: &CliOverrides) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// Apply `CONDUCTOR_*` overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = var("CONDUCTOR_STATE_DIR") {
            self.state.dir = PathBuf::from(dir);
        }
        if let Some(level) = var("CONDUCTOR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("CONDUCTOR_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(count) = var("CONDUCTOR_RETRY_COUNT") {
            self.engine.default_retry_count = count
                .parse()
                .with_context(|| format!("Invalid CONDUCTOR_RETRY_COUNT '{}'", count))?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(dir) = &cli.state_dir {
            self.state.dir = dir.clone();
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if let Some(count) = cli.retry_count {
            self.engine.default_retry_count = count;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.engine.max_backoff_ms < self.engine.retry_backoff_ms {
            warnings.push(format!(
                "max_backoff_ms ({}) is below retry_backoff_ms ({})",
                self.engine.max_backoff_ms, self.engine.retry_backoff_ms
            ));
        }
        if self.engine.action_timeout_secs == 0 || self.engine.phase_timeout_secs == 0 {
            warnings.push("Timeouts of 0 seconds fail every invocation".to_string());
        }
        for (team, members) in &self.teams {
            for member in members {
                if !self.workers.contains_key(member) {
                    warnings.push(format!("Team '{}' lists unknown worker '{}'", team, member));
                }
            }
        }
        warnings
    }

    /// Build a registry of HTTP workers and teams from the config.
    pub fn worker_registry(&self) -> Result<StaticRegistry> {
        let mut registry = StaticRegistry::new();
        for (id, worker) in &self.workers {
            let timeout = worker
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.engine.action_timeout());
            let http = HttpWorker::new(id, &worker.endpoint, timeout)
                .with_context(|| format!("Failed to build HTTP client for worker '{}'", id))?;
            let name = worker.display_name.as_deref().unwrap_or(id);
            registry = registry.with_named_worker(id, name, Arc::new(http));
        }
        for (team, members) in &self.teams {
            let members: Vec<&str> = members.iter().map(String::as_str).collect();
            registry = registry.with_team(team, &members);
        }
        Ok(registry)
    }
}
