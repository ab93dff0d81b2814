use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration, read once from `SLOTWISE_*` environment variables.
///
/// Provider settings (timezone, business hours, booking policy) are not part of
/// this: they are operator data stored in the WAL and changed at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Token a connection must present to act as the operator.
    pub operator_token: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: PathBuf::from("./data"),
            operator_token: "slotwise".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            sweep_interval: Duration::from_secs(30),
            write_timeout: Duration::from_millis(2_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("SLOTWISE_BIND").unwrap_or(defaults.bind),
            port: parse_or(&lookup, "SLOTWISE_PORT", defaults.port),
            data_dir: lookup("SLOTWISE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            operator_token: lookup("SLOTWISE_OPERATOR_TOKEN").unwrap_or(defaults.operator_token),
            max_connections: parse_or(&lookup, "SLOTWISE_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parse_or(&lookup, "SLOTWISE_COMPACT_THRESHOLD", defaults.compact_threshold),
            metrics_port: parse_opt(&lookup, "SLOTWISE_METRICS_PORT"),
            sweep_interval: parse_opt(&lookup, "SLOTWISE_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            write_timeout: parse_opt(&lookup, "SLOTWISE_WRITE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.write_timeout),
        }
    }

    /// True when `SLOTWISE_OPERATOR_TOKEN` was not set: anyone who knows the
    /// default can act as the operator.
    pub fn uses_default_operator_token(&self) -> bool {
        self.operator_token == Self::default().operator_token
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwise.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.parse().ok())
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    parse_opt(lookup, key).unwrap_or(default)
}
