//! Configuration for a projection deployment.
//!
//! # Example
//!
//! ```rust
//! use gridindex_core::config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .chain("sepolia")
//!     .database("gridindex.db")
//!     .registry("0x1111111111111111111111111111111111111111")
//!     .market("0x2222222222222222222222222222222222222222")
//!     .sweep_interval_secs(30)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.sweep_interval_secs, 30);
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CHECKPOINT_KEY;
use crate::entity::normalize_address;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Filter directives, e.g. `"info,gridindex_core=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Configuration of one projection deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridIndexConfig {
    /// Chain slug (e.g. `"ethereum"`).
    pub chain: String,
    /// SQLite database file, or `":memory:"`.
    pub database: String,
    /// Address of the provider/node registry contract.
    pub registry_address: String,
    /// Address of the compute market contract.
    pub market_address: String,
    /// Seconds between periodic sweeps.
    pub sweep_interval_secs: u64,
    /// Row key of the block checkpoint.
    pub checkpoint_key: String,
    pub log: LogConfig,
}

impl Default for GridIndexConfig {
    fn default() -> Self {
        Self {
            chain: "ethereum".into(),
            database: "gridindex.db".into(),
            registry_address: String::new(),
            market_address: String::new(),
            sweep_interval_secs: 60,
            checkpoint_key: CHECKPOINT_KEY.into(),
            log: LogConfig::default(),
        }
    }
}

impl GridIndexConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, address) in [
            ("registry_address", &self.registry_address),
            ("market_address", &self.market_address),
        ] {
            if !is_address(address) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a 0x-prefixed 20-byte hex address, got {address:?}"
                )));
            }
        }
        if self.registry_address == self.market_address {
            return Err(ConfigError::Invalid(
                "registry and market addresses must differ".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be > 0".into()));
        }
        if self.checkpoint_key.is_empty() {
            return Err(ConfigError::Invalid("checkpoint_key must not be empty".into()));
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.registry_address = normalize_address(&self.registry_address);
        self.market_address = normalize_address(&self.market_address);
    }
}

fn is_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Fluent builder for [`GridIndexConfig`].
#[derive(Default)]
pub struct ConfigBuilder {
    config: GridIndexConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    pub fn registry(mut self, address: impl Into<String>) -> Self {
        self.config.registry_address = address.into();
        self
    }

    pub fn market(mut self, address: impl Into<String>) -> Self {
        self.config.market_address = address.into();
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.sweep_interval_secs = secs;
        self
    }

    pub fn checkpoint_key(mut self, key: impl Into<String>) -> Self {
        self.config.checkpoint_key = key.into();
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.config.log = log;
        self
    }

    /// Validate and build the config.
    pub fn build(mut self) -> Result<GridIndexConfig, ConfigError> {
        self.config.normalize();
        self.config.validate()?;
        Ok(self.config)
    }
}
