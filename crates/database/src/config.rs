use std::path::Path;

use serde::{
    Deserialize,
    Serialize,
};

/// Tunable knobs for the background loops and query fan-out, per the
/// external-interfaces configuration options. Loaded once at startup; there
/// is no hot-reload path (compaction knobs changing under a live engine is
/// out of scope).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Cadence, in seconds, of the compaction timer thread.
    pub memory_sync_interval_seconds: u64,
    /// Minimum number of RAW files in a (table, date) group before
    /// `background_merge_files` merges them.
    pub merge_trigger_number: usize,
    /// Row-count threshold above which a merge's output is promoted to
    /// `TO_INDEX` instead of staying `RAW`.
    pub index_trigger_size: usize,
    /// Bounded worker-pool size for fanning a query out across segments.
    pub fanout_parallelism: usize,
    /// Row-count floor below which `build_index` refuses to train.
    pub minimum_trainable: usize,
    /// Age, in seconds, after which a `TO_DELETE` file is reclaimed.
    pub ttl_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_sync_interval_seconds: 5,
            merge_trigger_number: 4,
            index_trigger_size: 10_000,
            fanout_parallelism: 8,
            minimum_trainable: 256,
            ttl_seconds: 3600,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = Config::from_toml_str("merge_trigger_number = 1\n").unwrap();
        assert_eq!(config.merge_trigger_number, 1);
        assert_eq!(config.ttl_seconds, Config::default().ttl_seconds);
    }

    #[test]
    fn empty_document_is_all_defaults() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }
}
