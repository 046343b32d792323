//! Plugin configuration, loadable from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PersistError, PersistResult};

/// Reserved storage key holding the meta record.
pub const DEFAULT_META_KEY: &str = "micro-observables-persist:meta";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Storage key of the meta record. Namespaced to stay clear of user keys.
    pub meta_key: String,
    /// Log per-key restore and persist events at `info` instead of `debug`.
    pub verbose: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            meta_key: DEFAULT_META_KEY.to_string(),
            verbose: false,
        }
    }
}

impl PersistConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: PersistConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> PersistResult<()> {
        if self.meta_key.trim().is_empty() {
            return Err(PersistError::Config("meta_key must not be empty".to_string()));
        }
        Ok(())
    }
}
