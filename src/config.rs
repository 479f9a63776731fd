//! # Configuration
//!
//! Tunables of the statistics store and the duration parsing shared by every
//! configuration type. Durations accept human-readable strings such as
//! `"10s"`, `"500ms"`, `"250us"` or `"1m"`; a bare number means milliseconds.

use crate::error::{Result, StatsError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables of a `StatisticsStore`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of sample ticks to wait before a sample id is finalized
    pub merge_delay: u32,
    /// Number of SLA failures retained for reporting
    pub max_failures: usize,
    /// Quantiles (0.0 - 1.0) resolved in every summary
    pub percentiles: Vec<f64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            merge_delay: crate::defaults::MERGE_DELAY,
            max_failures: crate::defaults::MAX_FAILURES,
            percentiles: crate::defaults::PERCENTILES.to_vec(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(&p) = self
            .percentiles
            .iter()
            .find(|p| !(0.0..=1.0).contains(*p))
        {
            return Err(StatsError::InvalidPercentile(p));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("Failed to parse statistics store configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        Self::from_json_str(&json).with_context(|| format!("Invalid configuration in {:?}", path))
    }
}

/// Parse duration from string (e.g., "250us", "500ms", "10s", "5m", "1h")
///
/// Fractional values are accepted ("1.5s"); a value without unit is taken
/// as milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return Err(StatsError::InvalidDuration("duration cannot be empty".to_string()));
    }

    let (num_str, unit_ns) = if let Some(stripped) = s.strip_suffix("ns") {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix("us") {
        (stripped, 1e3)
    } else if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1e6)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1e9)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60e9)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600e9)
    } else {
        (s, 1e6)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| StatsError::InvalidDuration(format!("invalid number in duration: {}", s)))?;
    if !num.is_finite() || num < 0.0 {
        return Err(StatsError::InvalidDuration(format!(
            "duration must be a non-negative number: {}",
            s
        )));
    }

    Ok(Duration::from_nanos((num * unit_ns).round() as u64))
}

/// Format a duration in the most compact unit `parse_duration` reads back exactly
pub fn format_duration_compact(duration: Duration) -> String {
    let ns = duration.as_nanos();
    if ns == 0 {
        "0ms".to_string()
    } else if ns % 1_000_000_000 == 0 {
        format!("{}s", ns / 1_000_000_000)
    } else if ns % 1_000_000 == 0 {
        format!("{}ms", ns / 1_000_000)
    } else if ns % 1_000 == 0 {
        format!("{}us", ns / 1_000)
    } else {
        format!("{}ns", ns)
    }
}

/// Serde adapter for `Duration` fields written as human-readable strings
/// (or plain milliseconds).
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration_compact(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
            RawDuration::Text(text) => {
                super::parse_duration(&text).map_err(serde::de::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("42ns").unwrap(), Duration::from_nanos(42));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_millis(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_format_duration_compact_reads_back() {
        for duration in [
            Duration::from_secs(30),
            Duration::from_millis(1500),
            Duration::from_micros(250),
            Duration::from_nanos(7),
            Duration::ZERO,
        ] {
            let text = format_duration_compact(duration);
            assert_eq!(parse_duration(&text).unwrap(), duration, "{}", text);
        }
    }

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.merge_delay, 60);
        assert_eq!(config.max_failures, 100);
        assert_eq!(config.percentiles, vec![0.5, 0.9, 0.99, 0.999, 0.9999]);
    }

    #[test]
    fn test_store_config_rejects_bad_percentile() {
        let err = StoreConfig::from_json_str(r#"{"percentiles": [0.5, 95.0]}"#).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StatsError>(),
            Some(&StatsError::InvalidPercentile(95.0))
        );
    }

    #[test]
    fn test_store_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"merge_delay": 5, "max_failures": 10}}"#).unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.merge_delay, 5);
        assert_eq!(config.max_failures, 10);
        assert_eq!(config.percentiles.len(), 5);

        assert!(StoreConfig::from_file("/nonexistent/stats.json").is_err());
    }
}
