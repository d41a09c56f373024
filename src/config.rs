//! Engine Configuration
//!
//! Runtime settings, optionally loaded from a YAML file. Every field has a
//! default, so an empty file (or no file) yields an in-memory engine.
//!
//! ```yaml
//! state_dir: /var/lib/orderflow
//! working_dir: /data/jobs
//! poll_interval_ms: 500
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{OrderflowError, Result};

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for persisted definitions and work orders. In memory if unset.
    pub state_dir: Option<PathBuf>,

    /// Working directory for shell steps
    pub working_dir: Option<PathBuf>,

    /// Log step commands instead of running them
    pub dry_run: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            working_dir: None,
            dry_run: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(&content)?
        };

        if config.poll_interval_ms == 0 {
            return Err(OrderflowError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
