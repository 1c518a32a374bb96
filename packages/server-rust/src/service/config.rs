use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Flush behaviour of every delay cache (`cache.flush.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlushConfig {
    /// Directory prefix for drain logs. The drain appends `_<time>`.
    pub log_path: PathBuf,
    /// Whole-map flush attempts during a drain. At least 2 are made.
    pub try_all_count: u32,
    /// Attempts of a synchronous single-key flush.
    pub try_one_count: u32,
    /// Bound on one synchronous flush attempt in milliseconds.
    #[serde(rename = "timeOut")]
    pub timeout_ms: u64,
    /// Maximum commands per bulk backend request.
    pub batch_count: usize,
    /// Delay before a fresh buffer becomes eligible for flush.
    pub delay_millis: i64,
    /// Scheduler period in milliseconds.
    pub period_millis: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./cache-flush"),
            try_all_count: 3,
            try_one_count: 3,
            timeout_ms: 5_000,
            batch_count: 200,
            delay_millis: 0,
            period_millis: 2_000,
        }
    }
}

/// Delay cache configuration (`cache.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Buffered primary keys allowed to wait for their expiry. Keys past
    /// this count, latest expiry first, are flushed early.
    pub maximum_count: usize,
    pub flush: FlushConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            maximum_count: 5_000,
            flush: FlushConfig::default(),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cache: CacheConfig,
}

impl CacheConfig {
    /// Parses a `{"cache": {...}}` document. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] on malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> Result<Self, CacheError> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| CacheError::Config(e.to_string()))?;
        file.cache.validate()?;
        Ok(file.cache)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks the values a running cache divides or loops by.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<(), CacheError> {
        let flush = &self.flush;
        if flush.batch_count == 0 {
            return Err(CacheError::Config("cache.flush.batchCount must be >= 1".into()));
        }
        if flush.try_one_count == 0 {
            return Err(CacheError::Config("cache.flush.tryOneCount must be >= 1".into()));
        }
        if flush.timeout_ms == 0 {
            return Err(CacheError::Config("cache.flush.timeOut must be >= 1".into()));
        }
        if flush.period_millis == 0 {
            return Err(CacheError::Config("cache.flush.periodMillis must be >= 1".into()));
        }
        if flush.delay_millis < 0 {
            return Err(CacheError::Config("cache.flush.delayMillis must be >= 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush.timeout_ms)
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.flush.period_millis)
    }

    /// Whole-map attempts made by a drain.
    #[must_use]
    pub fn drain_attempts(&self) -> u32 {
        self.flush.try_all_count.max(2)
    }

    /// Random scheduler start delay in 1000..2000 ms on a 50 ms grid, so
    /// many caches started together do not tick in lockstep.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        let millis: u64 = rand::rng().random_range(1_000..2_000);
        Duration::from_millis(millis / 50 * 50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CacheConfig::default();
        assert_eq!(config.maximum_count, 5_000);
        assert_eq!(config.flush.batch_count, 200);
        assert_eq!(config.flush.period_millis, 2_000);
        assert_eq!(config.flush_timeout(), Duration::from_millis(5_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_nested_camel_case_keys() {
        let config = CacheConfig::from_json_str(
            r#"{"cache": {"maximumCount": 10,
                "flush": {"logPath": "/tmp/drain", "tryAllCount": 1,
                          "tryOneCount": 4, "timeOut": 250, "batchCount": 50}}}"#,
        )
        .unwrap();
        assert_eq!(config.maximum_count, 10);
        assert_eq!(config.flush.log_path, PathBuf::from("/tmp/drain"));
        assert_eq!(config.flush.try_one_count, 4);
        assert_eq!(config.flush.timeout_ms, 250);
        assert_eq!(config.flush.batch_count, 50);
        // Unset keys keep their defaults.
        assert_eq!(config.flush.period_millis, 2_000);
        assert_eq!(config.drain_attempts(), 2);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(CacheConfig::from_json_str("{}").unwrap(), CacheConfig::default());
    }

    #[test]
    fn zero_batch_count_is_rejected() {
        let err = CacheConfig::from_json_str(r#"{"cache": {"flush": {"batchCount": 0}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("batchCount"));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            CacheConfig::from_json_str("{cache"),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{"cache": {"maximumCount": 7}}"#).unwrap();
        assert_eq!(CacheConfig::from_path(&path).unwrap().maximum_count, 7);
        assert!(matches!(
            CacheConfig::from_path(dir.path().join("missing.json")),
            Err(CacheError::Io(_))
        ));
    }

    #[test]
    fn initial_delay_is_on_grid() {
        let config = CacheConfig::default();
        for _ in 0..50 {
            let millis = config.initial_delay().as_millis();
            assert!((1_000..2_000).contains(&millis));
            assert_eq!(millis % 50, 0);
        }
    }
}
