//! Engine configuration
//!
//! Loaded from YAML. Every field has a default so an empty file (or no file at all)
//! yields a working engine.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Env var naming the YAML config file.
pub const CONFIG_PATH_ENV: &str = "PROCFLOW_CONFIG";

/// Env var overriding `max_transitions_per_command`.
pub const MAX_TRANSITIONS_ENV: &str = "PROCFLOW_MAX_TRANSITIONS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stamped on every definition compiled by this engine.
    pub engine_version: Option<String>,
    /// Upper bound on element transitions executed by one command.
    pub max_transitions_per_command: usize,
    /// Upper bound on follow-up actions (thrown signals/messages) drained after a command.
    pub max_agenda_actions: usize,
    /// Skip redeploying a document whose checksum matches the latest deployment of the same name.
    pub duplicate_filtering: bool,
    /// Master switch for listener dispatch.
    pub event_dispatcher_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_version: None,
            max_transitions_per_command: 1_000,
            max_agenda_actions: 100,
            duplicate_filtering: true,
            event_dispatcher_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("invalid engine config")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    /// Config file named by `PROCFLOW_CONFIG` (defaults otherwise), then env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(raw) = std::env::var(MAX_TRANSITIONS_ENV) {
            config.max_transitions_per_command = raw
                .parse()
                .with_context(|| format!("{MAX_TRANSITIONS_ENV} must be a number, got '{raw}'"))?;
        }
        Ok(config)
    }
}
