//! Persisted root routing options

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Root router behavior for requests that match no rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RootRoutingOptions {
    /// Redirect unmatched hosts instead of serving the root endpoint
    pub enable_redirect_for_unset_rules: bool,

    /// Explicit redirect target; empty means redirect to the top-level domain
    pub unset_rule_redirect_target: String,
}

impl RootRoutingOptions {
    /// Load options from `path`, writing zero values first if the file does not exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            let options = Self::default();
            options.save(path)?;
            info!(path = ?path, "Created default root routing options");
            return Ok(options);
        }
        Self::load(path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
