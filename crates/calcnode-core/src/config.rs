//! Configuration system for calculation nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CALCNODE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/calcnode/config.toml
//!   3. ~/.config/calcnode/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalcNodeConfig {
    pub node: NodeConfig,
    pub cache: CacheConfig,
    pub execution: ExecutionConfig,
    pub blacklist: BlacklistConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Calculation nodes hosted by this process. 0 = one per CPU.
    pub node_count: u32,
    /// Prefix for generated node ids. Empty = "calcnode".
    pub node_id_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Buffer writes to the shared section and apply them in the background.
    pub write_behind_shared: bool,
    /// Same, for the private section.
    pub write_behind_private: bool,
    /// Bounded worker pool for write-behind and async target resolution.
    /// 0 = no pool.
    pub worker_threads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Resolve targets on the worker pool while inputs are fetched.
    pub async_target_resolve: bool,
    /// Per-item execution limit in ms. 0 = no watchdog.
    pub max_job_item_execution_ms: u64,
    /// How often the watchdog checks running items, in ms.
    pub watchdog_period_ms: u64,
}

/// Which fields of a failing item a blacklist rule pins down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistScope {
    /// Every item.
    Wildcard,
    /// Function id.
    Function,
    /// Function id and parameters.
    ParameterizedFunction,
    /// Function id, parameters and target.
    PartialNode,
    /// Function id, parameters, target, inputs and outputs.
    ExecutionNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistPolicyEntry {
    pub scope: BlacklistScope,
    /// How long a rule added for a failure stays active, in seconds.
    pub activation_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Query the blacklist before each item and add rules on failure.
    pub enabled: bool,
    pub policy: Vec<BlacklistPolicyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// HTTP API port on 127.0.0.1.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CalcNodeConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            cache: CacheConfig::default(),
            execution: ExecutionConfig::default(),
            blacklist: BlacklistConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_count: 0,
            node_id_prefix: String::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            write_behind_shared: false,
            write_behind_private: false,
            worker_threads: 4,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            async_target_resolve: false,
            max_job_item_execution_ms: 0,
            watchdog_period_ms: 1_000,
        }
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: vec![
                BlacklistPolicyEntry {
                    scope: BlacklistScope::ExecutionNode,
                    activation_secs: 3_600,
                },
                BlacklistPolicyEntry {
                    scope: BlacklistScope::PartialNode,
                    activation_secs: 300,
                },
            ],
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9101 }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("calcnode")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("write-behind caching requires a worker pool (cache.worker_threads > 0)")]
    WriteBehindWithoutWorkers,
    #[error("asynchronous target resolution requires a worker pool (cache.worker_threads > 0)")]
    AsyncResolveWithoutWorkers,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CalcNodeConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CalcNodeConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CALCNODE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CalcNodeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject combinations that can only fail later, at first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_pool = self.cache.worker_threads > 0;
        if (self.cache.write_behind_shared || self.cache.write_behind_private) && !has_pool {
            return Err(ConfigError::WriteBehindWithoutWorkers);
        }
        if self.execution.async_target_resolve && !has_pool {
            return Err(ConfigError::AsyncResolveWithoutWorkers);
        }
        Ok(())
    }

    /// Node count with 0 resolved to the CPU count.
    pub fn effective_node_count(&self) -> usize {
        if self.node.node_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.node.node_count as usize
        }
    }

    /// Apply CALCNODE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CALCNODE_NODE__NODE_COUNT") {
            if let Ok(n) = v.parse() {
                self.node.node_count = n;
            }
        }
        if let Ok(v) = std::env::var("CALCNODE_NODE__NODE_ID_PREFIX") {
            self.node.node_id_prefix = v;
        }
        if let Ok(v) = std::env::var("CALCNODE_CACHE__WRITE_BEHIND_SHARED") {
            self.cache.write_behind_shared = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CALCNODE_CACHE__WRITE_BEHIND_PRIVATE") {
            self.cache.write_behind_private = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CALCNODE_CACHE__WORKER_THREADS") {
            if let Ok(n) = v.parse() {
                self.cache.worker_threads = n;
            }
        }
        if let Ok(v) = std::env::var("CALCNODE_EXECUTION__ASYNC_TARGET_RESOLVE") {
            self.execution.async_target_resolve = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CALCNODE_EXECUTION__MAX_JOB_ITEM_EXECUTION_MS") {
            if let Ok(ms) = v.parse() {
                self.execution.max_job_item_execution_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("CALCNODE_BLACKLIST__ENABLED") {
            self.blacklist.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CALCNODE_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
    }
}
