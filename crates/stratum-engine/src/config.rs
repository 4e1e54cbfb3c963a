//! Process-level configuration for the root scope.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stratum_core::{fqn, Phase, Result, StratumError};
use stratum_planner::PlannerConfig;
use stratum_state::{FileSystemStateStore, InMemoryStateStore, SqliteStateStore, StateStore};

/// Default directory for on-disk state.
fn default_state_dir() -> PathBuf {
    PathBuf::from(".stratum")
}

/// Default stage name.
fn default_stage() -> String {
    "dev".to_string()
}

/// Where state is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    /// Process memory; nothing survives the process.
    Memory,
    /// One JSON file per record under `state_dir`.
    #[default]
    #[serde(alias = "fs")]
    FileSystem,
    /// `state_dir/state.db`.
    Sqlite,
}

impl FromStr for StateBackend {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StateBackend::Memory),
            "filesystem" | "fs" => Ok(StateBackend::FileSystem),
            "sqlite" => Ok(StateBackend::Sqlite),
            other => Err(StratumError::Config(format!(
                "state backend must be 'memory', 'filesystem' or 'sqlite', got: {other}"
            ))),
        }
    }
}

/// Configuration of one run.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application name; the first segment of every FQN.
    pub app_name: String,

    /// Stage (environment) name; the second segment of every FQN.
    pub stage: String,

    /// Run mode.
    pub phase: Phase,

    /// Passphrase for encrypting secrets at rest.
    pub password: Option<String>,

    /// Let create adopt existing remote resources for every type.
    pub adopt: bool,

    pub backend: StateBackend,

    /// Directory for the filesystem and SQLite backends.
    pub state_dir: PathBuf,

    pub planner: PlannerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            stage: default_stage(),
            phase: Phase::Up,
            password: None,
            adopt: false,
            backend: StateBackend::default(),
            state_dir: default_state_dir(),
            planner: PlannerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults for `app_name`.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Configuration from `STRATUM_*` environment variables.
    pub fn from_env(app_name: impl Into<String>) -> Result<Self> {
        Self::from_lookup(app_name, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        app_name: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new(app_name);

        if let Some(stage) = lookup("STRATUM_STAGE") {
            config.stage = stage;
        }
        if let Some(phase) = lookup("STRATUM_PHASE") {
            config.phase = phase.parse()?;
        }
        if let Some(password) = lookup("STRATUM_PASSWORD").filter(|p| !p.is_empty()) {
            config.password = Some(password);
        }
        if let Some(adopt) = lookup("STRATUM_ADOPT") {
            config.adopt = parse_flag("STRATUM_ADOPT", &adopt)?;
        }
        if let Some(backend) = lookup("STRATUM_STATE_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(dir) = lookup("STRATUM_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(limit) = lookup("STRATUM_MAX_CONCURRENT_DELETIONS") {
            config.planner.max_concurrent_deletions = limit.trim().parse().map_err(|_| {
                StratumError::Config(format!(
                    "STRATUM_MAX_CONCURRENT_DELETIONS must be a positive integer, got: {limit}"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StratumError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            StratumError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        fqn::validate_segment("app name", &self.app_name)
            .map_err(|e| StratumError::Config(e.to_string()))?;
        fqn::validate_segment("stage", &self.stage)
            .map_err(|e| StratumError::Config(e.to_string()))?;

        if self.planner.max_concurrent_deletions == 0 {
            return Err(StratumError::Config(
                "max_concurrent_deletions must be at least 1".to_string(),
            ));
        }
        if self.backend != StateBackend::Memory && self.state_dir.as_os_str().is_empty() {
            return Err(StratumError::Config(
                "state_dir is required for on-disk backends".to_string(),
            ));
        }
        Ok(())
    }

    /// Open the configured state backend.
    pub async fn open_store(&self) -> Result<Arc<dyn StateStore>> {
        Ok(match self.backend {
            StateBackend::Memory => Arc::new(InMemoryStateStore::new()),
            StateBackend::FileSystem => {
                Arc::new(FileSystemStateStore::open(self.state_dir.clone()).await?)
            }
            StateBackend::Sqlite => {
                Arc::new(SqliteStateStore::open(self.state_dir.join("state.db"))?)
            }
        })
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("app_name", &self.app_name)
            .field("stage", &self.stage)
            .field("phase", &self.phase)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("adopt", &self.adopt)
            .field("backend", &self.backend)
            .field("state_dir", &self.state_dir)
            .field("planner", &self.planner)
            .finish()
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(StratumError::Config(format!(
            "{name} must be a boolean, got: {other}"
        ))),
    }
}
