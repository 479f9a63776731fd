//! # Load Test Statistics Aggregator
//!
//! The statistics aggregation and SLA validation engine of a distributed load
//! tester. Load-generating agents run the same benchmark independently and
//! periodically report interval snapshots of request counters and a latency
//! histogram, tagged by phase, step and metric. This library reconciles those
//! independently clocked and independently delivered streams into one time
//! series and running totals, and evaluates user-defined SLAs against sliding
//! windows and phase totals while the run is in progress.
//!
//! ## Data Flow
//!
//! ```text
//! agent report ──▶ StatisticsStore::record(agent, phase, step, metric, snapshot)
//!                        │  (Data created on first report, SLA rules bound)
//!                        ▼
//!                  Data::record ── merge into total / per-agent / pending
//!                        │
//!                        ▼  sample id older than the merge delay
//!                  finalize ── combine agents ──▶ series, per-agent series
//!                        │
//!                        ▼
//!                  Window::add ──▶ SlaRule::validate ──▶ failure list + live callback
//! ```
//!
//! Completing a phase flushes the samples still held back by the merge delay
//! and evaluates the rules that apply to the phase total.
//!
//! ## Architecture Overview
//!
//! - `snapshot`: mergeable interval aggregates with an exact `unmerge`
//! - `window`: ring buffer keeping a running sum of the last N samples
//! - `data`: merge-delay reconciliation for one (phase, step, metric)
//! - `store`: registry of all aggregates, failure list, reporting queries
//! - `sla`: SLA rules, their checks and the resulting failures
//! - `aggregator`: Tokio task serializing access to a store
//! - `benchmark`, `config`: the benchmark model and tunables consumed by the store
//!
//! ## Usage Example
//!
//! ```rust
//! use stats_aggregator::{Benchmark, PhaseDef, SlaRule, Snapshot, StatisticsStore};
//! use std::time::Duration;
//!
//! # fn main() -> stats_aggregator::Result<()> {
//! let benchmark = Benchmark::new("checkout").with_phase(
//!     PhaseDef::new(0, "steady").with_sla("buy", SlaRule::phase_total().error_ratio(0.01)),
//! );
//! let mut store = StatisticsStore::new(benchmark, |failure| eprintln!("{}", failure))?;
//!
//! let mut snapshot = Snapshot::for_interval(0, 1_000, 2_000);
//! snapshot.record_request();
//! snapshot.record_response(Duration::from_millis(3));
//! store.record("agent-1", 0, 0, "buy", snapshot)?;
//!
//! store.complete_phase("steady");
//! assert!(store.validate_slas());
//! assert_eq!(store.total_summary()[0].summary.request_count, 1);
//! # Ok(())
//! # }
//! ```

/// Asynchronous front end owning a store
///
/// Serializes concurrent agent reports and reporting queries through a single
/// Tokio task, so that finalization never observes a half-updated aggregate.
pub mod aggregator;

/// Benchmark definition model
///
/// Phases, step SLA providers and the statistics collection period, with
/// builder methods and JSON loading.
pub mod benchmark;

/// Store tunables and duration parsing
pub mod config;

/// Per (phase, step, metric) aggregation with delayed finalization
pub mod data;

pub mod error;

/// Colorized log output and the live failure callback
pub mod logging;

/// Reporting model produced from snapshots
pub mod metrics;

/// Session pool, connection pool and CPU usage statistics
pub mod pools;

/// SLA rules, checks and failures
pub mod sla;

/// Mergeable, exactly reversible interval snapshots
pub mod snapshot;

/// Registry of all statistics of a benchmark run
///
/// Entry point for agent reports; owns the failure list, the phase lifecycle
/// and the reporting queries.
pub mod store;

pub mod utils;

/// Sliding windows over finalized samples
pub mod window;

pub use aggregator::{Aggregator, AggregatorHandle};
pub use benchmark::{Benchmark, PhaseDef};
pub use config::{parse_duration, StoreConfig};
pub use data::{ConsistencyIssue, ConsistencyKind, Data, RecordOutcome};
pub use error::{Result, StatsError};
pub use metrics::{PercentileValue, Summary};
pub use pools::{LowHigh, PoolStats};
pub use sla::{Failure, FailureSink, SlaCheck, SlaRule};
pub use snapshot::{Extension, Snapshot};
pub use store::{FailureLog, HistogramReport, RequestStats, StatisticsStore};
pub use window::Window;

/// The current version of the statistics aggregator
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Number of sample ticks a sample id is held back before finalization
    ///
    /// Agents report independently; contributions for the same interval can
    /// arrive many ticks apart. Sixty ticks of the default collection period
    /// tolerate a minute of skew while keeping the pending tables bounded.
    pub const MERGE_DELAY: u32 = 60;

    /// Number of SLA failures retained for the final report
    ///
    /// Further failures still reach the live callback.
    pub const MAX_FAILURES: usize = 100;

    /// Quantiles resolved in every summary
    pub const PERCENTILES: [f64; 5] = [0.5, 0.9, 0.99, 0.999, 0.9999];

    /// Default statistics collection period (length of one sample tick)
    pub const COLLECTION_PERIOD: Duration = Duration::from_secs(1);

    /// Connection pool records older than this are left out of recent summaries
    pub const CONNECTION_STATS_MAX_AGE: Duration = Duration::from_secs(5);

    /// Commands buffered by an aggregator before senders wait
    pub const AGGREGATOR_QUEUE_DEPTH: usize = 1024;
}
