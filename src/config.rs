use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Runtime settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Log appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    /// JSON member file loaded into the directory at startup.
    pub members_file: Option<PathBuf>,
    /// JSON-lines outbox for notifications; log output when unset.
    pub outbox_file: Option<PathBuf>,
    pub reminder_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            members_file: None,
            outbox_file: None,
            reminder_interval: Duration::from_secs(86_400),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let path = |key: &str| lookup(key).filter(|s| !s.is_empty()).map(PathBuf::from);
        Self {
            data_dir: path("SLOTBOOK_DATA_DIR").unwrap_or(defaults.data_dir),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT"),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            members_file: path("SLOTBOOK_MEMBERS"),
            outbox_file: path("SLOTBOOK_OUTBOX"),
            reminder_interval: parsed(&lookup, "SLOTBOOK_REMINDER_INTERVAL_SECS")
                .filter(|&secs: &u64| secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reminder_interval),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}
