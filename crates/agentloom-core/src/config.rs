//! Agentloom configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LoomError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoomConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl LoomConfig {
    /// Load config from the default path (~/.agentloom/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LoomError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| LoomError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LoomError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Agentloom home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agentloom")
    }
}

/// Worker pool and queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Queue capacity; defaults to `concurrency * 50`.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Running tasks untouched for this long are considered orphaned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Periodic recovery interval; derived from `stale_after_secs` when unset.
    #[serde(default)]
    pub recovery_interval_secs: Option<u64>,
    /// Delay used by the built-in no-op executor.
    #[serde(default = "default_noop_delay_ms")]
    pub noop_delay_ms: u64,
}

fn default_concurrency() -> usize { 5 }
fn default_stale_after_secs() -> u64 { 600 }
fn default_noop_delay_ms() -> u64 { 150 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: None,
            stale_after_secs: default_stale_after_secs(),
            recovery_interval_secs: None,
            noop_delay_ms: default_noop_delay_ms(),
        }
    }
}

impl EngineConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity
            .filter(|c| *c > 0)
            .unwrap_or(self.effective_concurrency() * 50)
    }

    pub fn stale_after(&self) -> Duration {
        if self.stale_after_secs == 0 {
            Duration::from_secs(default_stale_after_secs())
        } else {
            Duration::from_secs(self.stale_after_secs)
        }
    }

    /// Half the stale threshold, clamped to [30s, 10min].
    pub fn recovery_interval(&self) -> Duration {
        if let Some(secs) = self.recovery_interval_secs.filter(|s| *s > 0) {
            return Duration::from_secs(secs);
        }
        (self.stale_after() / 2).clamp(Duration::from_secs(30), Duration::from_secs(600))
    }
}

/// Objective scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// Max objectives dispatched per tick.
    #[serde(default = "default_due_batch")]
    pub due_batch: usize,
    #[serde(default = "default_backoff_min_secs")]
    pub failure_backoff_min_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub failure_backoff_max_secs: u64,
    /// Pause an objective after this many consecutive failed runs (0 disables).
    #[serde(default = "default_auto_pause_after")]
    pub auto_pause_after: u32,
}

fn bool_true() -> bool { true }
fn default_poll_secs() -> u64 { 15 }
fn default_due_batch() -> usize { 20 }
fn default_backoff_min_secs() -> u64 { 60 }
fn default_backoff_max_secs() -> u64 { 1800 }
fn default_auto_pause_after() -> u32 { 5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_secs: default_poll_secs(),
            due_batch: default_due_batch(),
            failure_backoff_min_secs: default_backoff_min_secs(),
            failure_backoff_max_secs: default_backoff_max_secs(),
            auto_pause_after: default_auto_pause_after(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        if self.poll_secs < 1 {
            Duration::from_secs(default_poll_secs())
        } else {
            Duration::from_secs(self.poll_secs)
        }
    }

    pub fn effective_due_batch(&self) -> usize {
        if self.due_batch == 0 { default_due_batch() } else { self.due_batch }
    }
}

/// Task result notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Base policy: "both", "admin", "origin", or "none".
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Override for succeeded tasks (empty = inherit `policy`).
    #[serde(default)]
    pub success_policy: String,
    /// Override for failed tasks (empty = inherit `policy`).
    #[serde(default)]
    pub failure_policy: String,
    /// Administrative channels, as "connector:external_id".
    #[serde(default)]
    pub admin_targets: Vec<String>,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    /// Connector name → outbound webhook URL.
    #[serde(default)]
    pub webhooks: BTreeMap<String, String>,
}

fn default_policy() -> String { "both".into() }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            success_policy: String::new(),
            failure_policy: String::new(),
            admin_targets: Vec::new(),
            telegram_bot_token: None,
            webhooks: BTreeMap::new(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.agentloom/agentloom.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Built-in executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// HTTP endpoint that runs tasks. Unset = built-in no-op executor.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Root under which markdown task artifacts are written, per workspace.
    #[serde(default)]
    pub workspace_root: Option<String>,
}

fn default_timeout_secs() -> u64 { 300 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_timeout_secs(),
            workspace_root: None,
        }
    }
}
