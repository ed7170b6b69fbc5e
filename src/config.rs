use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, str::FromStr};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::logger::{LogConfig, LogOutput};
use crate::script::BOOTSTRAP_SCRIPTS;
use crate::worker::DEFAULT_MAX_EXPR_DEPTH;

/// Prefix of every configuration key.
pub const PREFIX: &str = "DATAVISER_";

/// Where settings are read from.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// The process environment, optionally seeded from a `.env` file.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig;

impl EnvConfig {
    pub fn new(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => info!("loaded .env from {}", path.display()),
                    Err(e) => warn!("could not load .env from {}: {e}", path.display()),
                }
            }
        }
        Self
    }
}

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// In-memory settings, for tests and embedding.
#[derive(Debug, Default)]
pub struct MapConfig {
    values: DashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> &Self {
        self.values.insert(key.to_string(), value.into());
        self
    }
}

impl FromIterator<(String, String)> for MapConfig {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    /// Bounded wait for host replies; `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Bounded wait for interpreter replies; `None` waits forever.
    pub script_timeout: Option<Duration>,
    pub max_operations: u64,
    /// Script expression nesting limit; 0 is unbounded.
    pub max_expr_depth: usize,
    pub scripts_dir: Option<PathBuf>,
    pub bus_capacity: usize,
    pub bootstrap: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_dir: None,
            request_timeout: Some(Duration::from_millis(30_000)),
            script_timeout: Some(Duration::from_millis(60_000)),
            max_operations: 50_000_000,
            max_expr_depth: DEFAULT_MAX_EXPR_DEPTH,
            scripts_dir: None,
            bus_capacity: 1024,
            bootstrap: BOOTSTRAP_SCRIPTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Settings {
    pub fn load(source: &dyn ConfigSource) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| source.get(&format!("{PREFIX}{key}")).filter(|v| !v.trim().is_empty());

        let settings = Self {
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_dir: get("LOG_DIR").map(PathBuf::from),
            request_timeout: match get("REQUEST_TIMEOUT_MS") {
                Some(v) => millis(parse("REQUEST_TIMEOUT_MS", &v)?),
                None => defaults.request_timeout,
            },
            script_timeout: match get("SCRIPT_TIMEOUT_MS") {
                Some(v) => millis(parse("SCRIPT_TIMEOUT_MS", &v)?),
                None => defaults.script_timeout,
            },
            max_operations: match get("MAX_OPERATIONS") {
                Some(v) => parse("MAX_OPERATIONS", &v)?,
                None => defaults.max_operations,
            },
            max_expr_depth: match get("MAX_EXPR_DEPTH") {
                Some(v) => parse("MAX_EXPR_DEPTH", &v)?,
                None => defaults.max_expr_depth,
            },
            scripts_dir: get("SCRIPTS_DIR").map(PathBuf::from),
            bus_capacity: match get("BUS_CAPACITY") {
                Some(v) => parse("BUS_CAPACITY", &v)?,
                None => defaults.bus_capacity,
            },
            bootstrap: match get("BOOTSTRAP") {
                Some(v) => v
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => defaults.bootstrap,
            },
        };
        if settings.bus_capacity == 0 {
            anyhow::bail!("{PREFIX}BUS_CAPACITY must be at least 1");
        }
        Ok(settings)
    }

    pub fn log_config(&self, output_override: Option<LogOutput>) -> LogConfig {
        let output = output_override.unwrap_or_else(|| match &self.log_dir {
            Some(dir) => LogOutput::Dir(dir.clone()),
            None => LogOutput::Stdout,
        });
        LogConfig {
            log_level: self.log_level.clone(),
            output,
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{PREFIX}{key}: cannot parse `{value}`"))
}

/// `0` disables the bound.
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
