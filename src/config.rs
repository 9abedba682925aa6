use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read from `MEDISLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    pub strict_updates: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            metrics_port: None,
            strict_updates: false,
        }
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            port: parse(&get, "MEDISLOT_PORT").unwrap_or(defaults.port),
            bind: get("MEDISLOT_BIND").unwrap_or(defaults.bind),
            data_dir: get("MEDISLOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse(&get, "MEDISLOT_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse(&get, "MEDISLOT_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            compact_interval: parse(&get, "MEDISLOT_COMPACT_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.compact_interval),
            metrics_port: parse(&get, "MEDISLOT_METRICS_PORT"),
            strict_updates: get("MEDISLOT_STRICT_UPDATES")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.strict_updates),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("medislot.wal")
    }
}
