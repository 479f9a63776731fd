use crate::snapshot::Extension;
use crate::utils::format_latency;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Percentile value pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    /// Quantile in the range 0.0 - 1.0
    pub percentile: f64,
    pub value_ns: u64,
}

/// Immutable, percentile-resolved view of a snapshot used for reporting.
///
/// Timestamps are milliseconds since the Unix epoch, response times are in
/// nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub start_time: u64,
    pub end_time: u64,
    pub min_response_time: u64,
    pub mean_response_time: u64,
    pub std_dev_response_time: u64,
    pub max_response_time: u64,
    pub percentile_response_time: Vec<PercentileValue>,
    pub request_count: u64,
    pub response_count: u64,
    pub invalid: u64,
    pub connection_errors: u64,
    pub request_timeouts: u64,
    pub internal_errors: u64,
    pub blocked_time: u64,
    pub extensions: BTreeMap<String, Extension>,
}

impl Summary {
    /// Connection errors, timeouts and internal errors combined
    pub fn errors(&self) -> u64 {
        self.connection_errors + self.request_timeouts + self.internal_errors
    }

    /// Response time recorded for the given quantile, if it was requested
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        self.percentile_response_time
            .iter()
            .find(|p| (p.percentile - percentile).abs() < f64::EPSILON)
            .map(|p| p.value_ns)
    }

    /// Requests per second over the covered time range
    pub fn requests_per_second(&self) -> f64 {
        let duration_ms = self.end_time.saturating_sub(self.start_time);
        if duration_ms == 0 {
            0.0
        } else {
            self.request_count as f64 * 1000.0 / duration_ms as f64
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} responses={} mean={} max={}",
            self.request_count,
            self.response_count,
            format_latency(self.mean_response_time),
            format_latency(self.max_response_time)
        )?;
        for p in &self.percentile_response_time {
            write!(
                f,
                " p{}={}",
                (p.percentile * 10_000.0).round() / 100.0,
                format_latency(p.value_ns)
            )?;
        }
        if self.errors() > 0 || self.invalid > 0 {
            write!(f, " errors={} invalid={}", self.errors(), self.invalid)?;
        }
        Ok(())
    }
}
