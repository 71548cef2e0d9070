use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::{
    retry::RetryPolicy,
    tail::{DEFAULT_MAX_LINE_BYTES, DEFAULT_POLL_INTERVAL, MalformedLinePolicy, TailOptions},
};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub tail: TailConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads the config file at `path`, or the built-in defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail.poll_interval_ms)
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            poll_interval: self.poll_interval(),
            malformed_lines: self.ingest.malformed_lines,
            max_line_bytes: self.tail.max_line_bytes,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.store.retry;
        RetryPolicy::new(
            retry.max_attempts,
            Duration::from_millis(retry.initial_interval_ms),
            retry.backoff_coefficient,
            Some(Duration::from_millis(retry.maximum_interval_ms)),
        )
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.tail.poll_interval_ms == 0 {
            bail!("tail.poll_interval_ms must be greater than 0");
        }
        if self.tail.max_line_bytes == 0 {
            bail!("tail.max_line_bytes must be greater than 0");
        }
        let retry = &self.store.retry;
        if retry.max_attempts == 0 {
            bail!("store.retry.max_attempts must be at least 1");
        }
        if retry.backoff_coefficient == 0 {
            bail!("store.retry.backoff_coefficient must be at least 1");
        }
        if retry.maximum_interval_ms < retry.initial_interval_ms {
            bail!(
                "store.retry.maximum_interval_ms ({}) must not be below initial_interval_ms ({})",
                retry.maximum_interval_ms,
                retry.initial_interval_ms
            );
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TailConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default)]
    pub malformed_lines: MalformedLinePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Connection parameters come from the `host`, `port`, `user`, `password` and `database`
    /// environment variables.
    #[default]
    Mysql,
    Sqlite,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file for the `sqlite` backend.
    pub sqlite_path: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: u32,
    #[serde(default = "default_maximum_interval_ms")]
    pub maximum_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            maximum_interval_ms: default_maximum_interval_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    100
}

fn default_backoff_coefficient() -> u32 {
    2
}

fn default_maximum_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}
