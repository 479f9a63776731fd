//! # Service Level Agreements
//!
//! An `SlaRule` is a set of threshold checks evaluated against an aggregated
//! `Snapshot`. Rules with a positive window are evaluated continuously against
//! a sliding `Window` of finalized samples; rules without a window are
//! evaluated once, against the phase total, when the phase completes.
//!
//! The set of checks is closed (`SlaCheck`), so rules are plain data that can
//! be loaded from JSON:
//!
//! ```json
//! { "window": "10s", "checks": [
//!     { "check": "error_ratio", "max": 0.01 },
//!     { "check": "percentile", "percentile": 0.99, "max": "250ms" } ] }
//! ```

use crate::config::duration_str;
use crate::error::{Result, StatsError};
use crate::snapshot::Snapshot;
use crate::utils::{format_latency, format_timestamp_ms};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A single threshold of an SLA rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum SlaCheck {
    /// Maximum ratio of connection errors, timeouts and internal errors to requests
    ErrorRatio { max: f64 },
    /// Maximum ratio of responses marked invalid to responses
    InvalidRatio { max: f64 },
    /// Maximum mean response time
    MeanResponseTime {
        #[serde(with = "duration_str")]
        max: Duration,
    },
    /// Maximum ratio of time blocked waiting for a connection to blocked plus response time
    BlockedRatio { max: f64 },
    /// Maximum response time at the given quantile (0.0 - 1.0)
    Percentile {
        percentile: f64,
        #[serde(with = "duration_str")]
        max: Duration,
    },
}

impl SlaCheck {
    /// Returns the violation message if `statistics` breaks this check.
    fn evaluate(&self, statistics: &Snapshot) -> Option<String> {
        match *self {
            SlaCheck::ErrorRatio { max } => {
                let actual = ratio(statistics.errors(), statistics.request_count);
                (actual > max).then(|| {
                    format!("Error ratio exceeded: required {:.3}, actual {:.3}", max, actual)
                })
            }
            SlaCheck::InvalidRatio { max } => {
                let actual = ratio(statistics.invalid, statistics.response_count);
                (actual > max).then(|| {
                    format!("Invalid response ratio exceeded: required {:.3}, actual {:.3}", max, actual)
                })
            }
            SlaCheck::MeanResponseTime { max } => {
                let actual = statistics.histogram.mean();
                (actual > max.as_nanos() as f64).then(|| {
                    format!(
                        "Mean response time exceeded: required {}, actual {}",
                        format_latency(max.as_nanos() as u64),
                        format_latency(actual as u64)
                    )
                })
            }
            SlaCheck::BlockedRatio { max } => {
                let response_time = statistics.histogram.mean() * statistics.histogram.len() as f64;
                let blocked = statistics.blocked_time as f64;
                let actual = if blocked + response_time > 0.0 {
                    blocked / (blocked + response_time)
                } else {
                    0.0
                };
                (actual > max).then(|| {
                    format!("Blocked ratio exceeded: required {:.3}, actual {:.3}", max, actual)
                })
            }
            SlaCheck::Percentile { percentile, max } => {
                let actual = statistics.histogram.value_at_quantile(percentile);
                (actual as u128 > max.as_nanos()).then(|| {
                    format!(
                        "Response time at percentile {} exceeded: required {}, actual {}",
                        percentile,
                        format_latency(max.as_nanos() as u64),
                        format_latency(actual)
                    )
                })
            }
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Threshold predicate over either a sliding window or the phase total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaRule {
    /// Sliding window length; zero means the rule applies to the phase total
    #[serde(default, with = "duration_str")]
    pub window: Duration,
    #[serde(default)]
    pub checks: Vec<SlaCheck>,
}

impl SlaRule {
    /// Rule evaluated once against the phase total
    pub fn phase_total() -> Self {
        Self {
            window: Duration::ZERO,
            checks: Vec::new(),
        }
    }

    /// Rule evaluated against a sliding window of the given length
    pub fn windowed(window: Duration) -> Self {
        Self {
            window,
            checks: Vec::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_windowed(&self) -> bool {
        !self.window.is_zero()
    }

    pub fn error_ratio(mut self, max: f64) -> Self {
        self.checks.push(SlaCheck::ErrorRatio { max });
        self
    }

    pub fn invalid_ratio(mut self, max: f64) -> Self {
        self.checks.push(SlaCheck::InvalidRatio { max });
        self
    }

    pub fn mean_response_time(mut self, max: Duration) -> Self {
        self.checks.push(SlaCheck::MeanResponseTime { max });
        self
    }

    pub fn blocked_ratio(mut self, max: f64) -> Self {
        self.checks.push(SlaCheck::BlockedRatio { max });
        self
    }

    pub fn percentile_limit(mut self, percentile: f64, max: Duration) -> Self {
        self.checks.push(SlaCheck::Percentile { percentile, max });
        self
    }

    /// Reject definitions that can never be evaluated
    pub fn check_definition(&self) -> Result<()> {
        for check in &self.checks {
            if let SlaCheck::Percentile { percentile, .. } = *check {
                if !(0.0..=1.0).contains(&percentile) {
                    return Err(StatsError::InvalidPercentile(percentile));
                }
            }
        }
        Ok(())
    }

    /// Evaluate the checks in order; the first violated one produces a `Failure`.
    pub fn validate(&self, phase: &str, metric: &str, statistics: &Snapshot) -> Option<Failure> {
        self.checks
            .iter()
            .find_map(|check| check.evaluate(statistics))
            .map(|message| Failure {
                rule: Some(self.clone()),
                phase: phase.to_owned(),
                metric: Some(metric.to_owned()),
                statistics: statistics.clone(),
                message,
            })
    }
}

/// A detected SLA violation, or a failure reported from outside the engine
#[derive(Debug, Clone)]
pub struct Failure {
    rule: Option<SlaRule>,
    phase: String,
    metric: Option<String>,
    statistics: Snapshot,
    message: String,
}

impl Failure {
    /// Failure not produced by an SLA rule, e.g. an agent reporting a problem
    pub fn external(phase: &str, metric: Option<&str>, statistics: Snapshot, message: String) -> Self {
        Self {
            rule: None,
            phase: phase.to_owned(),
            metric: metric.map(str::to_owned),
            statistics,
            message,
        }
    }

    pub fn rule(&self) -> Option<&SlaRule> {
        self.rule.as_ref()
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn metric(&self) -> Option<&str> {
        self.metric.as_deref()
    }

    /// Statistics the rule was evaluated against
    pub fn statistics(&self) -> &Snapshot {
        &self.statistics
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this failure concerns the given phase and metric
    pub fn applies_to(&self, phase: &str, metric: &str) -> bool {
        self.phase == phase && self.metric.as_deref().map_or(true, |m| m == metric)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.phase, self.metric().unwrap_or("*"), self.message)?;
        if let (Some(start), Some(end)) = (self.statistics.start_time(), self.statistics.end_time()) {
            write!(
                f,
                " ({} - {})",
                format_timestamp_ms(start),
                format_timestamp_ms(end)
            )?;
        }
        Ok(())
    }
}

/// Destination of detected violations
pub trait FailureSink {
    fn add_failure(&mut self, failure: Failure);
}

impl FailureSink for Vec<Failure> {
    fn add_failure(&mut self, failure: Failure) {
        self.push(failure);
    }
}
