use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Database file for the sqlite backend (supports `~/`).
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
        }
    }
}

fn default_backend() -> StoreBackend { StoreBackend::Sqlite }
fn default_store_path() -> String { "~/.trellis/executions.db".to_string() }

/// Compare-and-swap retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Extra read-mutate-write attempts after the first version conflict.
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_cas_retries() -> u32 { 8 }
fn default_initial_backoff_ms() -> u64 { 1 }
fn default_max_backoff_ms() -> u64 { 50 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel capacity for node events.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "trellis=info,warn".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TrellisError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.events.capacity == 0 {
            return Err(TrellisError::Config(
                "events.capacity must be greater than zero".into(),
            ));
        }
        if self.concurrency.initial_backoff_ms > self.concurrency.max_backoff_ms {
            return Err(TrellisError::Config(
                "concurrency.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the sqlite database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let p = &self.store.path;
        if let Some(rest) = p.strip_prefix("~/") {
            if let Some(home) = home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(p)
    }
}

/// Substitute `${NAME}` and `${NAME:-fallback}` references from the
/// environment. An unset name with no fallback is left as written, and an
/// unterminated `${` is copied through.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(close) = tail.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let reference = &tail[..close];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        match (std::env::var(name).ok().filter(|v| !v.is_empty()), fallback) {
            (Some(value), _) => out.push_str(&value),
            (None, Some(fallback)) => out.push_str(fallback),
            (None, None) => match std::env::var(name) {
                // Set but empty
                Ok(_) => {}
                Err(_) => out.push_str(&rest[start..start + 3 + close]),
            },
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    out
}

/// `$HOME`, used for `~/` paths and the per-user config file.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
