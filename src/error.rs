use std::time::Duration;
use thiserror::Error;

/// Errors raised by the statistics engine.
///
/// Steady-state recording never fails because of the data it receives; these
/// errors describe configuration problems detected when a `Data` aggregate is
/// first created, contract breaches on snapshots, or an aggregator that has
/// already shut down.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("Unknown phase id: {0}")]
    UnknownPhase(u32),

    #[error("Unknown phase: {0}")]
    UnknownPhaseName(String),

    #[error("SLA window {window:?} does not fit statistics collected every {period:?}")]
    InvalidWindow { window: Duration, period: Duration },

    #[error("Statistics collection period must be greater than zero")]
    InvalidCollectionPeriod,

    #[error("Percentile must be between 0.0 and 1.0, got {0}")]
    InvalidPercentile(f64),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Histogram error: {0}")]
    Histogram(String),

    #[error("Cannot unmerge a snapshot that was never merged into this aggregate")]
    UnmergeMismatch,

    #[error("Statistics aggregator is no longer running")]
    AggregatorClosed,
}

pub type Result<T> = std::result::Result<T, StatsError>;
