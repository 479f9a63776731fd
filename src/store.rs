//! # Statistics Store
//!
//! The registry all agent reports flow into. Statistics are kept per
//! (phase, step) and metric in lazily created `Data` aggregates; the store owns
//! the bounded list of SLA failures, the phase completion lifecycle and the
//! pool statistics, and offers the read-only views used for live reporting and
//! for exporting results once the run is over.
//!
//! The store is not synchronized. Callers funnel every report and query
//! through one owner, e.g. the `Aggregator` task.

use crate::benchmark::Benchmark;
use crate::config::StoreConfig;
use crate::data::{ConsistencyIssue, Data, RecordOutcome};
use crate::error::{Result, StatsError};
use crate::metrics::Summary;
use crate::pools::{LowHigh, PoolStats};
use crate::sla::{Failure, FailureSink};
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

/// Live callback receiving every detected failure
pub type FailureHandler = Box<dyn FnMut(&Failure) + Send>;

/// Bounded list of failures plus the live failure callback.
///
/// Every failure reaches the callback; only the first `max_failures` are retained.
pub struct FailureLog {
    failures: Vec<Failure>,
    max_failures: usize,
    handler: FailureHandler,
}

impl FailureLog {
    pub fn new(max_failures: usize, handler: FailureHandler) -> Self {
        Self {
            failures: Vec::new(),
            max_failures,
            handler,
        }
    }

    /// Keep a failure for reporting without notifying the callback
    pub fn retain(&mut self, failure: Failure) {
        if self.failures.len() < self.max_failures {
            self.failures.push(failure);
        } else {
            debug!(phase = failure.phase(), "Failure list is full, not retaining failure");
        }
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Messages of the retained failures concerning the given phase and metric
    fn messages_for(&self, phase: &str, metric: &str) -> Vec<String> {
        self.failures
            .iter()
            .filter(|f| f.applies_to(phase, metric))
            .map(|f| f.message().to_owned())
            .collect()
    }
}

impl FailureSink for FailureLog {
    fn add_failure(&mut self, failure: Failure) {
        (self.handler)(&failure);
        self.retain(failure);
    }
}

impl fmt::Debug for FailureLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureLog")
            .field("failures", &self.failures)
            .field("max_failures", &self.max_failures)
            .finish_non_exhaustive()
    }
}

/// Statistics of one (phase, step, metric) triple prepared for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub phase: String,
    pub step_id: u32,
    pub metric: String,
    pub summary: Summary,
    /// Messages of retained failures concerning this phase and metric
    pub failed_slas: Vec<String>,
    pub is_warmup: bool,
}

/// One row of a latency percentile distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramRow {
    /// Highest latency in this row, in nanoseconds
    pub value_ns: u64,
    pub percentile: f64,
    pub count: u64,
    /// Responses up to and including this row
    pub total_count: u64,
}

/// Percentile distribution of a metric's total latencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramReport {
    pub phase: String,
    pub metric: String,
    pub start_time: u64,
    pub end_time: u64,
    pub rows: Vec<HistogramRow>,
}

impl HistogramReport {
    fn from_snapshot(phase: &str, metric: &str, snapshot: &Snapshot) -> Self {
        let mut total_count = 0;
        let rows = snapshot
            .histogram
            .iter_quantiles(1)
            .map(|value| {
                total_count += value.count_since_last_iteration();
                HistogramRow {
                    value_ns: value.value_iterated_to(),
                    percentile: value.quantile_iterated_to(),
                    count: value.count_since_last_iteration(),
                    total_count,
                }
            })
            .collect();
        Self {
            phase: phase.to_owned(),
            metric: metric.to_owned(),
            start_time: snapshot.start_time().unwrap_or(0),
            end_time: snapshot.end_time().unwrap_or(0),
            rows,
        }
    }
}

/// Registry of all statistics of one benchmark run
#[derive(Debug)]
pub struct StatisticsStore {
    benchmark: Benchmark,
    config: StoreConfig,
    data: HashMap<(u32, u32), HashMap<String, Data>>,
    failures: FailureLog,
    pools: PoolStats,
}

impl StatisticsStore {
    /// Create a store with default tunables
    pub fn new<F>(benchmark: Benchmark, handler: F) -> Result<Self>
    where
        F: FnMut(&Failure) + Send + 'static,
    {
        Self::with_config(benchmark, StoreConfig::default(), handler)
    }

    pub fn with_config<F>(benchmark: Benchmark, config: StoreConfig, handler: F) -> Result<Self>
    where
        F: FnMut(&Failure) + Send + 'static,
    {
        config.validate()?;
        if benchmark.statistics_collection_period.is_zero() {
            return Err(StatsError::InvalidCollectionPeriod);
        }
        info!(
            benchmark = %benchmark.name,
            merge_delay = config.merge_delay,
            max_failures = config.max_failures,
            "Created statistics store"
        );
        Ok(Self {
            failures: FailureLog::new(config.max_failures, Box::new(handler)),
            benchmark,
            config,
            data: HashMap::new(),
            pools: PoolStats::new(),
        })
    }

    pub fn benchmark(&self) -> &Benchmark {
        &self.benchmark
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Route an agent's report to the aggregate of its phase, step and metric.
    ///
    /// The aggregate is created on the first report; an error means its SLA
    /// rules could not be bound. Reports for completed phases are ignored.
    pub fn record(
        &mut self,
        agent: &str,
        phase_id: u32,
        step_id: u32,
        metric: &str,
        snapshot: Snapshot,
    ) -> Result<RecordOutcome> {
        let phase = self.benchmark.phase_by_id(phase_id)?;
        let by_metric = self.data.entry((phase_id, step_id)).or_default();
        let data = match by_metric.entry(metric.to_owned()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let rules = self.benchmark.rules_for(phase, step_id, metric);
                entry.insert(Data::new(
                    phase,
                    step_id,
                    metric,
                    rules,
                    self.benchmark.statistics_collection_period,
                    &self.config,
                )?)
            }
        };
        Ok(data.record(agent, snapshot, &mut self.failures))
    }

    /// Retain a failure and pass it to the live callback
    pub fn add_failure(&mut self, failure: Failure) {
        self.failures.add_failure(failure);
    }

    /// Retain a failure reported from outside of SLA evaluation, e.g. by an agent
    pub fn add_external_failure(
        &mut self,
        phase: &str,
        metric: Option<&str>,
        start: u64,
        end: u64,
        cause: impl Into<String>,
    ) {
        let statistics = Snapshot::for_interval(0, start, end);
        self.failures
            .retain(Failure::external(phase, metric, statistics, cause.into()));
    }

    /// Complete every aggregate of the phase
    pub fn complete_phase(&mut self, phase: &str) {
        let mut completed = 0;
        for data in self.data.values_mut().flat_map(HashMap::values_mut) {
            if data.phase() == phase && !data.is_completed() {
                data.complete_phase(&mut self.failures);
                completed += 1;
            }
        }
        debug!(phase, completed, "Completed phase statistics");
    }

    /// Complete every aggregate that was not completed yet, reporting each one
    pub fn complete_all<F: FnMut(String)>(&mut self, mut error_handler: F) {
        for data in self.data.values_mut().flat_map(HashMap::values_mut) {
            if !data.is_completed() {
                error_handler(format!(
                    "Data for {}/{}/{} were not completed when the phase terminated - was the data received after that?",
                    data.phase(),
                    data.step_id(),
                    data.metric()
                ));
                data.complete_phase(&mut self.failures);
            }
        }
    }

    /// Stretch the totals of the phase to its actual start and completion time.
    ///
    /// With few requests the reported intervals can be much shorter than the
    /// phase, which would inflate the computed throughput.
    pub fn adjust_phase_timestamps(&mut self, phase: &str, start: u64, completion: u64) {
        for data in self.data.values_mut().flat_map(HashMap::values_mut) {
            if data.phase() == phase {
                data.adjust_time_range(start, completion);
            }
        }
    }

    /// True when no failure has been retained
    pub fn validate_slas(&self) -> bool {
        self.failures.is_empty()
    }

    /// Statistics of the latest complete sample of every aggregate
    pub fn recent_summary(&self, min_valid_timestamp: u64) -> Vec<RequestStats> {
        self.data()
            .into_iter()
            .filter_map(|data| {
                let summary = data.recent_summary(min_valid_timestamp)?;
                Some(self.request_stats(data, summary))
            })
            .collect()
    }

    /// Totals of every aggregate, completed or not
    pub fn total_summary(&self) -> Vec<RequestStats> {
        self.data()
            .into_iter()
            .map(|data| self.request_stats(data, data.total().summarize(data.percentiles())))
            .collect()
    }

    fn request_stats(&self, data: &Data, summary: Summary) -> RequestStats {
        RequestStats {
            phase: data.phase().to_owned(),
            step_id: data.step_id(),
            metric: data.metric().to_owned(),
            summary,
            failed_slas: self.failures.messages_for(data.phase(), data.metric()),
            is_warmup: data.is_warmup(),
        }
    }

    pub fn get_data(&self, phase: &str, step_id: u32, metric: &str) -> Option<&Data> {
        let phase_id = self.benchmark.phase_by_name(phase).ok()?.id;
        self.data.get(&(phase_id, step_id))?.get(metric)
    }

    /// Percentile distribution of the total latencies of one metric
    pub fn histogram(&self, phase: &str, step_id: u32, metric: &str) -> Option<HistogramReport> {
        let data = self.get_data(phase, step_id, metric)?;
        Some(HistogramReport::from_snapshot(phase, metric, data.total()))
    }

    pub fn series(&self, phase: &str, step_id: u32, metric: &str) -> Option<&[Summary]> {
        self.get_data(phase, step_id, metric).map(Data::series)
    }

    /// All aggregates ordered by phase, metric and step
    pub fn data(&self) -> Vec<&Data> {
        let mut all: Vec<&Data> = self.data.values().flat_map(HashMap::values).collect();
        all.sort_by(|a, b| {
            (a.phase(), a.metric(), a.step_id()).cmp(&(b.phase(), b.metric(), b.step_id()))
        });
        all
    }

    pub fn failures(&self) -> &[Failure] {
        self.failures.failures()
    }

    /// Consistency problems found when phases completed
    pub fn consistency_issues(&self) -> Vec<ConsistencyIssue> {
        self.data()
            .into_iter()
            .flat_map(|data| data.consistency_issues().iter().cloned())
            .collect()
    }

    pub fn record_session_stats(&mut self, agent: &str, timestamp: u64, phase: &str, min: u32, max: u32) {
        self.pools.record_sessions(agent, timestamp, phase, min, max);
    }

    pub fn record_connection_stats(
        &mut self,
        agent: &str,
        timestamp: u64,
        stats: &BTreeMap<String, BTreeMap<String, LowHigh>>,
    ) {
        self.pools.record_connections(agent, timestamp, stats);
    }

    pub fn record_cpu_usage(&mut self, phase: &str, agent: &str, usage: &str) {
        self.pools.record_cpu_usage(phase, agent, usage);
    }

    /// Connection pool ranges reported within the last few seconds
    pub fn recent_connections_summary(&self) -> BTreeMap<String, BTreeMap<String, LowHigh>> {
        let max_age = crate::defaults::CONNECTION_STATS_MAX_AGE.as_millis() as u64;
        let now = crate::utils::current_timestamp_ms();
        self.pools
            .recent_connections_summary(now.saturating_sub(max_age))
    }

    pub fn pools(&self) -> &PoolStats {
        &self.pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::PhaseDef;
    use crate::sla::SlaRule;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn benchmark() -> Benchmark {
        Benchmark::new("test")
            .with_phase(PhaseDef::new(0, "warmup").warmup())
            .with_phase(PhaseDef::new(1, "steady").with_sla(
                "checkout",
                SlaRule::phase_total().mean_response_time(Duration::from_millis(1)),
            ))
    }

    fn report(sample_id: u32, requests: u64, latency: Duration) -> Snapshot {
        let start = u64::from(sample_id) * 1_000;
        let mut snapshot = Snapshot::for_interval(sample_id, start, start + 1_000);
        for _ in 0..requests {
            snapshot.record_request();
            snapshot.record_response(latency);
        }
        snapshot
    }

    #[test]
    fn test_record_unknown_phase_fails() {
        let mut store = StatisticsStore::new(benchmark(), |_| {}).unwrap();
        let result = store.record("a", 9, 0, "m", report(0, 1, Duration::from_millis(1)));
        assert_eq!(result, Err(StatsError::UnknownPhase(9)));
        assert!(store.data.is_empty());
    }

    #[test]
    fn test_total_rule_failure_reaches_callback_and_summary() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut store = StatisticsStore::new(benchmark(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for id in 0..3 {
            let outcome = store
                .record("a", 1, 0, "checkout", report(id, 2, Duration::from_millis(5)))
                .unwrap();
            assert!(outcome.is_accepted());
        }
        assert!(store.validate_slas());

        store.complete_phase("steady");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!store.validate_slas());

        let total = store.total_summary();
        assert_eq!(total.len(), 1);
        assert_eq!(total[0].summary.request_count, 6);
        assert_eq!(total[0].failed_slas.len(), 1);
        assert!(!total[0].is_warmup);
    }

    #[test]
    fn test_complete_all_reports_incomplete_data() {
        let mut store = StatisticsStore::new(benchmark(), |_| {}).unwrap();
        store
            .record("a", 0, 0, "browse", report(0, 1, Duration::from_millis(1)))
            .unwrap();
        store
            .record("a", 1, 2, "browse", report(0, 1, Duration::from_millis(1)))
            .unwrap();
        store.complete_phase("warmup");

        let mut messages = Vec::new();
        store.complete_all(|message| messages.push(message));
        assert_eq!(
            messages,
            vec!["Data for steady/2/browse were not completed when the phase terminated - was the data received after that?"]
        );
        assert!(store.data().iter().all(|data| data.is_completed()));
    }

    #[test]
    fn test_data_is_sorted_by_phase_metric_step() {
        let mut store = StatisticsStore::new(benchmark(), |_| {}).unwrap();
        for (phase, step, metric) in [(1, 2, "b"), (0, 0, "z"), (1, 1, "b"), (1, 0, "a")] {
            store
                .record("a", phase, step, metric, report(0, 1, Duration::from_millis(1)))
                .unwrap();
        }
        let keys: Vec<_> = store
            .data()
            .iter()
            .map(|d| (d.phase().to_owned(), d.metric().to_owned(), d.step_id()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("steady".to_string(), "a".to_string(), 0),
                ("steady".to_string(), "b".to_string(), 1),
                ("steady".to_string(), "b".to_string(), 2),
                ("warmup".to_string(), "z".to_string(), 0),
            ]
        );
    }

    #[test]
    fn test_lookups_and_timestamp_adjustment() {
        let mut store = StatisticsStore::new(benchmark(), |_| {}).unwrap();
        for id in 0..4 {
            store
                .record("a", 1, 0, "browse", report(id, 10, Duration::from_millis(id as u64 + 1)))
                .unwrap();
        }
        store.complete_phase("steady");
        store.adjust_phase_timestamps("steady", 0, 10_000);

        assert_eq!(store.series("steady", 0, "browse").map(<[Summary]>::len), Some(4));
        assert!(store.series("steady", 1, "browse").is_none());
        assert!(store.series("missing", 0, "browse").is_none());

        let histogram = store.histogram("steady", 0, "browse").unwrap();
        assert_eq!(histogram.start_time, 0);
        assert_eq!(histogram.end_time, 10_000);
        assert_eq!(histogram.rows.last().map(|row| row.total_count), Some(40));
    }

    #[test]
    fn test_external_failures_are_retained() {
        let mut store = StatisticsStore::new(benchmark(), |_| {
            panic!("external failures are not dispatched");
        })
        .unwrap();
        store.add_external_failure("steady", None, 1_000, 2_000, "Agent a1 disconnected");
        assert_eq!(store.failures().len(), 1);
        assert_eq!(store.failures()[0].message(), "Agent a1 disconnected");
        assert_eq!(store.failures()[0].statistics().start_time(), Some(1_000));
    }

    #[test]
    fn test_pool_statistics_are_delegated() {
        let mut store = StatisticsStore::new(benchmark(), |_| {}).unwrap();
        store.record_session_stats("a1", 1_000, "steady", 1, 4);
        store.record_cpu_usage("steady", "a1", "12%");
        assert_eq!(
            store.pools().total_session_summary()["steady"]["a1"],
            LowHigh::new(1, 4)
        );
        assert_eq!(store.pools().cpu_usage()["steady"]["a1"], "12%");

        let now = crate::utils::current_timestamp_ms();
        let stats = BTreeMap::from([(
            "localhost:8080".to_string(),
            BTreeMap::from([("http1".to_string(), LowHigh::new(2, 3))]),
        )]);
        store.record_connection_stats("a1", now, &stats);
        assert_eq!(
            store.recent_connections_summary()["localhost:8080"]["http1"],
            LowHigh::new(2, 3)
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StoreConfig {
            percentiles: vec![1.5],
            ..StoreConfig::default()
        };
        assert_eq!(
            StatisticsStore::with_config(benchmark(), config, |_| {}).unwrap_err(),
            StatsError::InvalidPercentile(1.5)
        );
    }
}
