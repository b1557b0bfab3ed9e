use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 150;
pub const DEFAULT_BRIDGE_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_CONFIRMATION_TTL_MS: i64 = 600_000;
pub const DEFAULT_REMINDER_DEBOUNCE_MS: i64 = 3_000;
pub const DEFAULT_TOKEN_BUDGET: u64 = 120_000;
pub const DEFAULT_CONTEXT_STEPS: usize = 4;
pub const DEFAULT_CONTEXT_CHARS_PER_STEP: usize = 4_000;

pub const DEFAULT_DESTRUCTIVE_MARKERS: &[&str] = &[
    "delete",
    "reset",
    "overwrite",
    "clear",
    "drop",
    "force",
    "rm -rf",
    "truncate",
    "purge",
    "删除",
    "清空",
    "重置",
    "覆盖",
];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub confirmation: ConfirmationSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeSettings {
    /// Directory holding `requests/`, `responses/` and `status/`. Relative
    /// paths resolve against `state_root`.
    #[serde(default = "default_queue_root")]
    pub queue_root: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_bridge_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_root: default_queue_root(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            default_timeout_ms: DEFAULT_BRIDGE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfirmationSettings {
    #[serde(default = "default_confirmation_ttl_ms")]
    pub ttl_ms: i64,
    #[serde(default = "default_reminder_debounce_ms")]
    pub reminder_debounce_ms: i64,
    #[serde(default)]
    pub always_confirm: bool,
    #[serde(default = "default_destructive_markers")]
    pub destructive_markers: Vec<String>,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_CONFIRMATION_TTL_MS,
            reminder_debounce_ms: DEFAULT_REMINDER_DEBOUNCE_MS,
            always_confirm: false,
            destructive_markers: default_destructive_markers(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct BudgetSettings {
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    #[serde(default = "default_bridge_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            timeout_ms: DEFAULT_BRIDGE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct RunnerSettings {
    #[serde(default = "default_context_steps")]
    pub context_steps: usize,
    #[serde(default = "default_context_chars_per_step")]
    pub context_chars_per_step: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            context_steps: DEFAULT_CONTEXT_STEPS,
            context_chars_per_step: DEFAULT_CONTEXT_CHARS_PER_STEP,
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Settings rooted at `state_root` with every other value defaulted.
    pub fn with_state_root(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "state_root must be non-empty".to_string(),
            ));
        }
        if self.bridge.poll_interval_ms == 0 {
            return Err(ConfigError::Settings(
                "bridge.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.bridge.default_timeout_ms < self.bridge.poll_interval_ms {
            return Err(ConfigError::Settings(
                "bridge.default_timeout_ms must be at least one poll interval".to_string(),
            ));
        }
        if self.confirmation.ttl_ms <= 0 {
            return Err(ConfigError::Settings(
                "confirmation.ttl_ms must be greater than zero".to_string(),
            ));
        }
        if self.confirmation.reminder_debounce_ms < 0
            || self.confirmation.reminder_debounce_ms > self.confirmation.ttl_ms
        {
            return Err(ConfigError::Settings(
                "confirmation.reminder_debounce_ms must be between 0 and ttl_ms".to_string(),
            ));
        }
        if self
            .confirmation
            .destructive_markers
            .iter()
            .all(|marker| marker.trim().is_empty())
        {
            return Err(ConfigError::Settings(
                "confirmation.destructive_markers must contain at least one marker".to_string(),
            ));
        }
        if self.budget.token_budget == 0 {
            return Err(ConfigError::Settings(
                "budget.token_budget must be greater than zero".to_string(),
            ));
        }
        if self.runner.context_steps == 0 {
            return Err(ConfigError::Settings(
                "runner.context_steps must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn queue_root(&self) -> PathBuf {
        if self.bridge.queue_root.is_absolute() {
            self.bridge.queue_root.clone()
        } else {
            self.state_root.join(&self.bridge.queue_root)
        }
    }
}

fn default_state_root() -> PathBuf {
    super::paths::default_state_root().unwrap_or_else(|_| PathBuf::from(".taskrelay"))
}

fn default_queue_root() -> PathBuf {
    PathBuf::from("bridge")
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_bridge_timeout_ms() -> u64 {
    DEFAULT_BRIDGE_TIMEOUT_MS
}

fn default_confirmation_ttl_ms() -> i64 {
    DEFAULT_CONFIRMATION_TTL_MS
}

fn default_reminder_debounce_ms() -> i64 {
    DEFAULT_REMINDER_DEBOUNCE_MS
}

fn default_destructive_markers() -> Vec<String> {
    DEFAULT_DESTRUCTIVE_MARKERS
        .iter()
        .map(|marker| marker.to_string())
        .collect()
}

fn default_token_budget() -> u64 {
    DEFAULT_TOKEN_BUDGET
}

fn default_context_steps() -> usize {
    DEFAULT_CONTEXT_STEPS
}

fn default_context_chars_per_step() -> usize {
    DEFAULT_CONTEXT_CHARS_PER_STEP
}
