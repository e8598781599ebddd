//! TOML configuration for the proxy.
//!
//! Configuration is optional: every field has a default, a missing file
//! means defaults, and CLI flags override whatever the file said.
//!
//! ```toml
//! [listen]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [decrypt]
//! enabled = true
//! mode = "include"            # or "exclude"
//! hosts = ["*.example.com", "api.internal:8443"]
//!
//! [ca]
//! leaf-validity-days = 14
//! key-profile = "ecdsa-p256"  # or "ecdsa-p384"
//!
//! [cache]
//! capacity = 128
//! ```

use crate::ca::{KeyProfile, DEFAULT_LEAF_VALIDITY_DAYS};
use crate::cli::Cli;
use crate::proxy::FilterMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from loading or merging configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Path we tried to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// Path we tried to parse.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A CLI value did not parse.
    #[error("invalid listen address '{0}': expected HOST:PORT")]
    InvalidListen(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener settings.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Decrypt policy settings.
    #[serde(default)]
    pub decrypt: DecryptConfig,
    /// Certificate issuance settings.
    #[serde(default)]
    pub ca: CaConfig,
    /// Context cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Where the proxy listens.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port; 0 asks the OS for a free port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Which TLS targets get intercepted.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DecryptConfig {
    /// Master switch; off means every tunnel is relayed untouched.
    #[serde(default)]
    pub enabled: bool,
    /// How `hosts` is interpreted.
    #[serde(default)]
    pub mode: FilterMode,
    /// Host patterns, `*` wildcards allowed.
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Certificate issuance settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CaConfig {
    /// Validity of minted leaf certificates, in days.
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
    /// Key algorithm for the root and leaves.
    #[serde(default)]
    pub key_profile: KeyProfile,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            leaf_validity_days: default_leaf_validity_days(),
            key_profile: KeyProfile::default(),
        }
    }
}

/// Context cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of cached server contexts.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_leaf_validity_days() -> u32 {
    DEFAULT_LEAF_VALIDITY_DAYS
}

fn default_cache_capacity() -> usize {
    128
}

impl Config {
    /// Load configuration from an optional file path.
    ///
    /// `None` yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            debug!("No config file given, using defaults");
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply CLI overrides on top of file values.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), ConfigError> {
        if let Some(listen) = &cli.listen {
            let (host, port) = listen
                .rsplit_once(':')
                .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
                .filter(|(host, _)| !host.is_empty())
                .ok_or_else(|| ConfigError::InvalidListen(listen.clone()))?;
            self.listen.host = host.to_string();
            self.listen.port = port;
        }

        if cli.decrypt {
            self.decrypt.enabled = true;
        }
        if let Some(mode) = cli.decrypt_mode {
            self.decrypt.mode = mode.into();
        }
        if !cli.decrypt_hosts.is_empty() {
            self.decrypt.hosts.extend(cli.decrypt_hosts.iter().cloned());
        }
        if let Some(capacity) = cli.cache_capacity {
            self.cache.capacity = capacity;
        }

        Ok(())
    }
}
