use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::DEFAULT_AVERAGE_SERVICE_MINUTES;

/// Daemon settings, read from `SLOTQ_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub average_service_minutes: u32,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    /// Prometheus exporter port; `None` leaves metrics off.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            average_service_minutes: DEFAULT_AVERAGE_SERVICE_MINUTES,
            compact_threshold: 1000,
            reaper_interval: Duration::from_secs(5),
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            data_dir: lookup("SLOTQ_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            average_service_minutes: parsed(&lookup, "SLOTQ_AVG_SERVICE_MINUTES")
                .unwrap_or(defaults.average_service_minutes),
            compact_threshold: parsed(&lookup, "SLOTQ_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            reaper_interval: parsed::<u64>(&lookup, "SLOTQ_REAPER_INTERVAL_SECS")
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_interval),
            metrics_port: parsed(&lookup, "SLOTQ_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotq.wal")
    }
}
