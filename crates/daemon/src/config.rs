// Daemon configuration - environment variables with validated defaults

use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BEANSTALK_ADDR: &str = "127.0.0.1:11300";
pub const DEFAULT_TUBE: &str = "conveyor";
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_SCALE_INTERVAL_MS: u64 = 1000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub beanstalk_addr: String,
    pub tube: String,
    pub workers: usize,
    pub max_workers: usize,
    pub scale_interval: Duration,
    pub poll_timeout: Duration,
    pub log_format: LogFormat,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_format = match lookup("CONVEYOR_LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("CONVEYOR_LOG_FORMAT must be `json` or `pretty`, got {other:?}"),
        };

        let config = Self {
            beanstalk_addr: lookup("CONVEYOR_BEANSTALK_ADDR")
                .unwrap_or_else(|| DEFAULT_BEANSTALK_ADDR.to_string()),
            tube: lookup("CONVEYOR_TUBE").unwrap_or_else(|| DEFAULT_TUBE.to_string()),
            workers: parse_or(&lookup, "CONVEYOR_WORKERS", DEFAULT_WORKERS)?,
            max_workers: parse_or(&lookup, "CONVEYOR_MAX_WORKERS", DEFAULT_MAX_WORKERS)?,
            scale_interval: Duration::from_millis(parse_or(
                &lookup,
                "CONVEYOR_SCALE_INTERVAL_MS",
                DEFAULT_SCALE_INTERVAL_MS,
            )?),
            poll_timeout: Duration::from_millis(parse_or(
                &lookup,
                "CONVEYOR_POLL_TIMEOUT_MS",
                DEFAULT_POLL_TIMEOUT_MS,
            )?),
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("CONVEYOR_WORKERS must be at least 1");
        }
        if self.max_workers < self.workers {
            bail!(
                "CONVEYOR_MAX_WORKERS ({}) must not be below CONVEYOR_WORKERS ({})",
                self.max_workers,
                self.workers
            );
        }
        if self.scale_interval.is_zero() {
            bail!("CONVEYOR_SCALE_INTERVAL_MS must be positive");
        }
        Ok(())
    }
}

fn parse_or<N>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: N) -> Result<N>
where
    N: FromStr,
    N::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value {raw:?}")),
    }
}
