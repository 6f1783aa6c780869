use std::path::PathBuf;

/// Process configuration, read once from `ROOMLEDGER_*` environment variables.
/// Malformed numbers fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Appends since the last compaction before `compact_if_needed` rewrites a tenant's log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub compact_on_audit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            metrics_port: None,
            compact_on_audit: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("ROOMLEDGER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            compact_threshold: lookup("ROOMLEDGER_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("ROOMLEDGER_METRICS_PORT").and_then(|s| s.parse().ok()),
            compact_on_audit: lookup("ROOMLEDGER_COMPACT_ON_AUDIT")
                .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.compact_on_audit),
        }
    }
}
