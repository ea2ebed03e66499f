use crate::engine_paths;
use crate::pipeline::QueryRetryPolicy;
use crate::reliability::outbox::RelayConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, usually `~/.workflow-engine/config.yaml`.
///
/// Every section is optional; missing values fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub query_retry: QueryRetrySettings,
    #[serde(default)]
    pub agent: AgentSettings,
    /// Overrides `~/.workflow-engine/workspaces`.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Overrides `~/.workflow-engine/templates`.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    #[default]
    JsonFile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Store document for `json_file`; defaults to `~/.workflow-engine/engine.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RelaySettings {
    #[serde(default = "default_relay_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_relay_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_relay_max_retries")]
    pub max_retries: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            interval_secs: default_relay_interval_secs(),
            batch_size: default_relay_batch_size(),
            max_retries: default_relay_max_retries(),
        }
    }
}

fn default_relay_interval_secs() -> u64 {
    5
}

fn default_relay_batch_size() -> usize {
    100
}

fn default_relay_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueryRetrySettings {
    #[serde(default = "default_query_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_query_delay_secs")]
    pub delay_secs: u64,
}

impl Default for QueryRetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_query_max_retries(),
            delay_secs: default_query_delay_secs(),
        }
    }
}

fn default_query_max_retries() -> u32 {
    2
}

fn default_query_delay_secs() -> u64 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["-p".to_string()]
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, else the home config if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let home_config = engine_paths::config_path()?;
        if home_config.exists() {
            Self::load(&home_config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.interval_secs == 0 {
            anyhow::bail!("relay.interval_secs must be at least 1");
        }
        if self.relay.batch_size == 0 {
            anyhow::bail!("relay.batch_size must be at least 1");
        }
        if self.agent.command.trim().is_empty() {
            anyhow::bail!("agent.command must not be empty");
        }
        if self.storage.backend == StorageBackend::Memory && self.storage.path.is_some() {
            anyhow::bail!("storage.path is only valid for the json_file backend");
        }
        Ok(())
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            interval: Duration::from_secs(self.relay.interval_secs),
            batch_size: self.relay.batch_size,
            max_retries: self.relay.max_retries,
        }
    }

    pub fn query_retry_policy(&self) -> QueryRetryPolicy {
        QueryRetryPolicy {
            max_retries: self.query_retry.max_retries,
            delay: Duration::from_secs(self.query_retry.delay_secs),
        }
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.storage.path {
            Some(path) => Ok(path.clone()),
            None => engine_paths::store_path(),
        }
    }

    pub fn workspace_root(&self) -> Result<PathBuf> {
        match &self.workspace_root {
            Some(path) => Ok(path.clone()),
            None => engine_paths::workspaces_dir(),
        }
    }

    pub fn templates_dir(&self) -> Result<PathBuf> {
        match &self.templates_dir {
            Some(path) => Ok(path.clone()),
            None => engine_paths::templates_dir(),
        }
    }
}
