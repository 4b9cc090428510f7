//! Process configuration from `PARKALLOC_*` environment variables.
//!
//! Numeric settings that fail to parse fall back to their defaults. A bad
//! timezone, batch run time or a zero job interval is an error.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::batch::BatchSettings;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PARKALLOC_TIMEZONE: unknown timezone {0:?}")]
    Timezone(String),
    #[error("PARKALLOC_BATCH_RUN_AT: expected HH:MM, got {0:?}")]
    RunAt(String),
    #[error("{0}: interval must be at least one second")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub timezone: Tz,
    pub batch_run_at: NaiveTime,
    pub cost_base: i64,
    pub priority_delta: i64,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub compact_check_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let timezone = match lookup("PARKALLOC_TIMEZONE") {
            Some(name) => name.trim().parse::<Tz>().map_err(|_| ConfigError::Timezone(name))?,
            None => chrono_tz::UTC,
        };
        let batch_run_at = match lookup("PARKALLOC_BATCH_RUN_AT") {
            Some(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| ConfigError::RunAt(s))?,
            None => NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
        };

        Ok(Self {
            data_dir: lookup("PARKALLOC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: parsed(&lookup, "PARKALLOC_METRICS_PORT"),
            timezone,
            batch_run_at,
            cost_base: parsed(&lookup, "PARKALLOC_COST_BASE").unwrap_or(1_000),
            priority_delta: parsed(&lookup, "PARKALLOC_PRIORITY_DELTA").unwrap_or(-5),
            sweep_interval: interval(&lookup, "PARKALLOC_SWEEP_INTERVAL_SECS", 60)?,
            compact_threshold: parsed(&lookup, "PARKALLOC_COMPACT_THRESHOLD").unwrap_or(1_000),
            compact_check_interval: interval(&lookup, "PARKALLOC_COMPACT_CHECK_SECS", 30)?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkalloc.wal")
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            timezone: self.timezone,
            cost_base: self.cost_base,
            priority_delta: self.priority_delta,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

/// Seconds for a periodic job; `tokio::time::interval` cannot tick at zero.
fn interval(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default_secs: u64,
) -> Result<Duration, ConfigError> {
    match parsed(lookup, key).unwrap_or(default_secs) {
        0 => Err(ConfigError::ZeroInterval(key)),
        secs => Ok(Duration::from_secs(secs)),
    }
}
