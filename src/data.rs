//! # Per-Metric Aggregation
//!
//! `Data` owns every piece of aggregation state for one (phase, step, metric)
//! triple. Agents report independently and their snapshots for the same sample
//! id can arrive many ticks apart, so contributions are held in a pending
//! table and only combined once the highest sample id seen from any agent is
//! `merge_delay` ticks ahead of them.
//!
//! ## Lifecycle
//!
//! 1. `record` merges a report into the running totals and the pending table,
//!    then finalizes every sample id that fell out of the merge delay.
//! 2. Finalization combines all agents' contributions of one sample id, appends
//!    the summaries to the series and feeds the combined snapshot into the
//!    sliding windows of the windowed SLA rules. Sample ids nobody reported
//!    data for still advance the windows as empty samples.
//! 3. `complete_phase` flushes the sample ids still within the delay, checks
//!    the series against the totals and evaluates the phase-total rules.
//!
//! After completion further reports are ignored.
//!
//! An agent that never reports a sample id simply does not contribute to it;
//! a report arriving after its sample id was finalized stays pending and shows
//! up as a consistency issue when the phase completes.

use crate::benchmark::PhaseDef;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::metrics::Summary;
use crate::sla::{FailureSink, SlaRule};
use crate::snapshot::Snapshot;
use crate::window::Window;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Result of handing a report to `Data::record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted,
    /// The phase was already completed; nothing was changed
    IgnoredCompleted,
}

impl RecordOutcome {
    pub fn is_accepted(self) -> bool {
        self == RecordOutcome::Accepted
    }
}

/// Which aggregate disagreed with the total at phase completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyKind {
    /// Combined series against the total
    Series,
    /// Per-agent totals against the total
    PerAgent,
    /// One agent's series against that agent's total
    AgentSeries { agent: String },
}

/// Request counts that did not add up when a phase completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub phase: String,
    pub step_id: u32,
    pub metric: String,
    #[serde(flatten)]
    pub kind: ConsistencyKind,
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.kind {
            ConsistencyKind::Series => "series".to_string(),
            ConsistencyKind::PerAgent => "per-agent totals".to_string(),
            ConsistencyKind::AgentSeries { agent } => format!("series of agent {}", agent),
        };
        write!(
            f,
            "{}/{}/{}: {} hold {} requests, expected {}",
            self.phase, self.step_id, self.metric, source, self.actual, self.expected
        )
    }
}

/// Aggregation state of one (phase, step, metric) triple
#[derive(Debug)]
pub struct Data {
    phase: String,
    step_id: u32,
    metric: String,
    is_warmup: bool,
    merge_delay: u32,
    percentiles: Vec<f64>,
    total: Snapshot,
    per_agent: BTreeMap<String, Snapshot>,
    pending: HashMap<String, BTreeMap<u32, Snapshot>>,
    series: Vec<Summary>,
    agent_series: BTreeMap<String, Vec<Summary>>,
    window_rules: Vec<(SlaRule, Window)>,
    total_rules: Vec<SlaRule>,
    highest_sample_id: Option<u32>,
    /// Lowest sample id not finalized yet
    next_sample_id: u64,
    completed: bool,
    consistency_issues: Vec<ConsistencyIssue>,
}

impl Data {
    /// Bind `rules` to a new aggregate, sizing one window per windowed rule
    pub fn new(
        phase: &PhaseDef,
        step_id: u32,
        metric: &str,
        rules: &[SlaRule],
        collection_period: Duration,
        config: &StoreConfig,
    ) -> Result<Self> {
        let mut window_rules = Vec::new();
        let mut total_rules = Vec::new();
        for rule in rules {
            rule.check_definition()?;
            if rule.is_windowed() {
                let window = Window::for_rule(rule.window(), collection_period)?;
                window_rules.push((rule.clone(), window));
            } else {
                total_rules.push(rule.clone());
            }
        }

        debug!(
            phase = %phase.name,
            step_id,
            metric,
            windowed_rules = window_rules.len(),
            total_rules = total_rules.len(),
            "Created statistics aggregate"
        );

        Ok(Self {
            phase: phase.name.clone(),
            step_id,
            metric: metric.to_owned(),
            is_warmup: phase.is_warmup,
            merge_delay: config.merge_delay,
            percentiles: config.percentiles.clone(),
            total: Snapshot::default(),
            per_agent: BTreeMap::new(),
            pending: HashMap::new(),
            series: Vec::new(),
            agent_series: BTreeMap::new(),
            window_rules,
            total_rules,
            highest_sample_id: None,
            next_sample_id: 0,
            completed: false,
            consistency_issues: Vec::new(),
        })
    }

    /// Merge one agent's report and finalize sample ids that left the merge delay
    pub fn record(
        &mut self,
        agent: &str,
        snapshot: Snapshot,
        failures: &mut dyn FailureSink,
    ) -> RecordOutcome {
        if self.completed {
            warn!(
                phase = %self.phase,
                step_id = self.step_id,
                metric = %self.metric,
                agent,
                sample_id = snapshot.sample_id,
                "Ignoring statistics received after the phase completed"
            );
            return RecordOutcome::IgnoredCompleted;
        }

        self.total.merge(&snapshot);
        self.per_agent
            .entry(agent.to_owned())
            .or_default()
            .merge(&snapshot);

        let sample_id = snapshot.sample_id;
        if u64::from(sample_id) < self.next_sample_id {
            warn!(
                phase = %self.phase,
                metric = %self.metric,
                agent,
                sample_id,
                "Statistics arrived after their sample was finalized"
            );
        }
        let samples = self.pending.entry(agent.to_owned()).or_default();
        match samples.entry(sample_id) {
            Entry::Vacant(entry) => {
                entry.insert(snapshot);
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().merge(&snapshot);
            }
        }

        let highest = self.highest_sample_id.map_or(sample_id, |h| h.max(sample_id));
        self.highest_sample_id = Some(highest);
        let end = (u64::from(highest) + 1).saturating_sub(u64::from(self.merge_delay));
        self.finalize_until(end, failures);
        RecordOutcome::Accepted
    }

    /// Finalize every sample id below `end`.
    ///
    /// Runs of ids without any pending contribution are fed to the windows as
    /// idle samples in one step.
    fn finalize_until(&mut self, end: u64, failures: &mut dyn FailureSink) {
        while self.next_sample_id < end {
            let next_pending = self.next_pending_sample_id().map_or(end, |id| id.min(end));
            if next_pending > self.next_sample_id {
                self.add_idle_samples(next_pending, failures);
            } else {
                self.finalize(self.next_sample_id as u32, failures);
            }
            self.next_sample_id = next_pending.max(self.next_sample_id + 1);
        }
    }

    /// Lowest pending sample id not finalized yet
    fn next_pending_sample_id(&self) -> Option<u64> {
        let from = u32::try_from(self.next_sample_id).ok()?;
        self.pending
            .values()
            .filter_map(|samples| samples.range(from..).next().map(|(&id, _)| u64::from(id)))
            .min()
    }

    fn finalize(&mut self, sample_id: u32, failures: &mut dyn FailureSink) {
        let mut combined = Snapshot::new(sample_id);
        for (agent, samples) in &mut self.pending {
            if let Some(snapshot) = samples.remove(&sample_id) {
                combined.merge(&snapshot);
                self.agent_series
                    .entry(agent.clone())
                    .or_default()
                    .push(snapshot.summarize(&self.percentiles));
            }
        }
        trace!(
            phase = %self.phase,
            metric = %self.metric,
            sample_id,
            requests = combined.request_count,
            "Finalized sample"
        );
        if !combined.is_empty() {
            self.series.push(combined.summarize(&self.percentiles));
        }

        let combined = Arc::new(combined);
        for (rule, window) in &mut self.window_rules {
            window.add(Arc::clone(&combined));
            evaluate_window(rule, window, &self.phase, &self.metric, failures);
        }
    }

    /// Advance the windows over the sample ids from `next_sample_id` up to `end`, none of which has data.
    ///
    /// A window that received `capacity` idle samples in a row holds nothing
    /// else, and further idle samples leave its sum unchanged.
    fn add_idle_samples(&mut self, end: u64, failures: &mut dyn FailureSink) {
        let first = self.next_sample_id;
        let count = end - first;
        trace!(
            phase = %self.phase,
            metric = %self.metric,
            first,
            count,
            "Finalized idle samples"
        );
        for (rule, window) in &mut self.window_rules {
            let inserts = count.min(window.capacity() as u64);
            for sample_id in first..first + inserts {
                window.add(Arc::new(Snapshot::new(sample_id as u32)));
                evaluate_window(rule, window, &self.phase, &self.metric, failures);
            }
        }
    }

    /// Flush the remaining sample ids, evaluate phase-total rules and stop accepting reports.
    ///
    /// Repeated calls have no effect.
    pub fn complete_phase(&mut self, failures: &mut dyn FailureSink) {
        if self.completed {
            return;
        }
        if let Some(highest) = self.highest_sample_id {
            self.finalize_until(u64::from(highest) + 1, failures);
        }
        self.check_consistency();
        for rule in &self.total_rules {
            if let Some(failure) = rule.validate(&self.phase, &self.metric, &self.total) {
                failures.add_failure(failure);
            }
        }
        self.completed = true;
    }

    fn check_consistency(&mut self) {
        let expected = self.total.request_count;
        let series: u64 = self.series.iter().map(|s| s.request_count).sum();
        self.report_mismatch(ConsistencyKind::Series, expected, series);

        let per_agent: u64 = self.per_agent.values().map(|s| s.request_count).sum();
        self.report_mismatch(ConsistencyKind::PerAgent, expected, per_agent);

        let agent_series: Vec<_> = self
            .per_agent
            .iter()
            .map(|(agent, total)| {
                let actual = self
                    .agent_series
                    .get(agent)
                    .map_or(0, |series| series.iter().map(|s| s.request_count).sum());
                (agent.clone(), total.request_count, actual)
            })
            .collect();
        for (agent, expected, actual) in agent_series {
            self.report_mismatch(ConsistencyKind::AgentSeries { agent }, expected, actual);
        }
    }

    fn report_mismatch(&mut self, kind: ConsistencyKind, expected: u64, actual: u64) {
        if expected == actual {
            return;
        }
        let issue = ConsistencyIssue {
            phase: self.phase.clone(),
            step_id: self.step_id,
            metric: self.metric.clone(),
            kind,
            expected,
            actual,
        };
        error!(
            phase = %issue.phase,
            step_id = issue.step_id,
            metric = %issue.metric,
            expected,
            actual,
            "Statistics inconsistency: {}",
            issue
        );
        self.consistency_issues.push(issue);
    }

    /// Combined statistics of the sample just before the newest pending one.
    ///
    /// The newest sample is likely still incomplete. Returns `None` when there
    /// is no such sample or it started before `min_valid_timestamp`.
    pub fn recent_summary(&self, min_valid_timestamp: u64) -> Option<Summary> {
        let last = self
            .pending
            .values()
            .filter_map(|samples| samples.keys().next_back().copied())
            .max()?;
        let penultimate = last.checked_sub(1)?;

        let mut sum = Snapshot::new(penultimate);
        for snapshot in self.pending.values().filter_map(|samples| samples.get(&penultimate)) {
            sum.merge(snapshot);
        }
        if sum.is_empty() || sum.start_time().unwrap_or(0) < min_valid_timestamp {
            return None;
        }
        Some(sum.summarize(&self.percentiles))
    }

    /// Widen the total's time range to the phase boundaries (epoch millis)
    pub fn adjust_time_range(&mut self, start: u64, end: u64) {
        self.total.extend_time_range(start, end);
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn step_id(&self) -> u32 {
        self.step_id
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn is_warmup(&self) -> bool {
        self.is_warmup
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn percentiles(&self) -> &[f64] {
        &self.percentiles
    }

    /// Lifetime sum across all agents
    pub fn total(&self) -> &Snapshot {
        &self.total
    }

    pub fn per_agent(&self) -> &BTreeMap<String, Snapshot> {
        &self.per_agent
    }

    /// Combined summaries of finalized samples, in finalization order
    pub fn series(&self) -> &[Summary] {
        &self.series
    }

    pub fn agent_series(&self) -> &BTreeMap<String, Vec<Summary>> {
        &self.agent_series
    }

    pub fn highest_sample_id(&self) -> Option<u32> {
        self.highest_sample_id
    }

    /// Number of agent contributions not finalized yet
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    pub fn consistency_issues(&self) -> &[ConsistencyIssue] {
        &self.consistency_issues
    }

    pub fn windowed_rules(&self) -> impl Iterator<Item = (&SlaRule, &Window)> {
        self.window_rules.iter().map(|(rule, window)| (rule, window))
    }

    pub fn total_rules(&self) -> &[SlaRule] {
        &self.total_rules
    }
}

fn evaluate_window(
    rule: &SlaRule,
    window: &Window,
    phase: &str,
    metric: &str,
    failures: &mut dyn FailureSink,
) {
    if !window.is_full() {
        return;
    }
    if let Some(failure) = rule.validate(phase, metric, window.sum()) {
        failures.add_failure(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sla::Failure;

    fn config(merge_delay: u32) -> StoreConfig {
        StoreConfig {
            merge_delay,
            ..StoreConfig::default()
        }
    }

    fn data(merge_delay: u32, rules: &[SlaRule]) -> Data {
        Data::new(
            &PhaseDef::new(0, "p"),
            0,
            "m",
            rules,
            Duration::from_secs(1),
            &config(merge_delay),
        )
        .unwrap()
    }

    fn report(sample_id: u32, requests: u64) -> Snapshot {
        let start = u64::from(sample_id) * 1_000;
        let mut snapshot = Snapshot::for_interval(sample_id, start, start + 1_000);
        for _ in 0..requests {
            snapshot.record_request();
            snapshot.record_response(Duration::from_millis(2));
        }
        snapshot
    }

    #[test]
    fn test_finalization_waits_for_merge_delay() {
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(2, &[]);

        data.record("a", report(0, 5), &mut failures);
        data.record("a", report(1, 5), &mut failures);
        assert!(data.series().is_empty());

        data.record("b", report(0, 3), &mut failures);
        data.record("a", report(2, 5), &mut failures);
        assert_eq!(data.series().len(), 1);
        assert_eq!(data.series()[0].request_count, 8);
        assert_eq!(data.agent_series()["a"].len(), 1);
        assert_eq!(data.agent_series()["b"].len(), 1);
        assert_eq!(data.pending_len(), 2);
    }

    #[test]
    fn test_partial_reports_are_merged() {
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(1, &[]);

        data.record("a", report(0, 2), &mut failures);
        data.record("a", report(1, 1), &mut failures);
        data.record("a", report(1, 1), &mut failures);
        data.complete_phase(&mut failures);

        assert_eq!(data.series().len(), 2);
        assert_eq!(data.series()[1].request_count, 2);
        assert_eq!(data.total().request_count, 4);
    }

    #[test]
    fn test_complete_phase_flushes_and_rejects_late_reports() {
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(60, &[]);
        for id in 0..10 {
            data.record("a", report(id, 1), &mut failures);
        }
        assert!(data.series().is_empty());

        data.complete_phase(&mut failures);
        assert!(data.is_completed());
        assert_eq!(data.series().len(), 10);
        assert_eq!(data.pending_len(), 0);
        assert!(data.consistency_issues().is_empty());

        let outcome = data.record("a", report(10, 7), &mut failures);
        assert_eq!(outcome, RecordOutcome::IgnoredCompleted);
        assert_eq!(data.total().request_count, 10);
        assert_eq!(data.series().len(), 10);
    }

    #[test]
    fn test_report_after_finalization_is_a_consistency_issue() {
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(1, &[]);
        data.record("a", report(0, 1), &mut failures);
        data.record("a", report(1, 1), &mut failures);
        data.record("b", report(0, 4), &mut failures);
        data.complete_phase(&mut failures);

        assert_eq!(data.total().request_count, 6);
        let issues = data.consistency_issues();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].kind, ConsistencyKind::Series);
        assert_eq!((issues[0].expected, issues[0].actual), (6, 2));
        assert_eq!(
            issues[1].kind,
            ConsistencyKind::AgentSeries {
                agent: "b".to_string()
            }
        );
    }

    #[test]
    fn test_windowed_rule_evaluated_once_window_is_full() {
        let rule = SlaRule::windowed(Duration::from_secs(3)).mean_response_time(Duration::from_millis(1));
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(0, &[rule]);

        data.record("a", report(0, 1), &mut failures);
        data.record("a", report(1, 1), &mut failures);
        assert!(failures.is_empty());

        data.record("a", report(2, 1), &mut failures);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].statistics().request_count, 3);
    }

    #[test]
    fn test_jump_ahead_advances_windows_over_idle_run() {
        let rule = SlaRule::windowed(Duration::from_secs(3)).error_ratio(0.1);
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(0, &[rule]);

        let mut bad = report(0, 10);
        bad.connection_errors = 5;
        data.record("a", bad, &mut failures);
        data.record("a", report(u32::MAX, 10), &mut failures);

        // only the window over ids 0..=2 still holds the errors
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].statistics().request_count, 10);
        assert_eq!(data.series().len(), 2);
        assert_eq!(data.pending_len(), 0);

        let (_, window) = data.windowed_rules().next().unwrap();
        assert!(window.is_full());
        assert_eq!(window.sum().request_count, 10);
        assert_eq!(window.sum().connection_errors, 0);
        assert_eq!(window.sum().start_time(), Some(u64::from(u32::MAX) * 1_000));
    }

    #[test]
    fn test_idle_samples_in_flushed_tail_reach_windows() {
        let rule = SlaRule::windowed(Duration::from_secs(2)).mean_response_time(Duration::from_millis(1));
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(60, &[rule]);

        data.record("a", report(0, 1), &mut failures);
        data.record("a", Snapshot::for_interval(1, 1_000, 2_000), &mut failures);
        data.complete_phase(&mut failures);

        assert_eq!(data.series().len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].statistics().start_time(), Some(0));
        assert_eq!(failures[0].statistics().end_time(), Some(2_000));
    }

    #[test]
    fn test_total_rule_evaluated_at_completion() {
        let rule = SlaRule::phase_total().mean_response_time(Duration::from_millis(1));
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(0, &[rule]);
        for id in 0..5 {
            data.record("a", report(id, 1), &mut failures);
        }
        assert!(failures.is_empty());

        data.complete_phase(&mut failures);
        data.complete_phase(&mut failures);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].statistics().request_count, 5);
    }

    #[test]
    fn test_new_rejects_short_window() {
        let rule = SlaRule::windowed(Duration::from_millis(10)).error_ratio(0.1);
        let result = Data::new(
            &PhaseDef::new(0, "p"),
            0,
            "m",
            &[rule],
            Duration::from_secs(1),
            &StoreConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_recent_summary_uses_penultimate_sample() {
        let mut failures: Vec<Failure> = Vec::new();
        let mut data = data(60, &[]);
        assert!(data.recent_summary(0).is_none());

        data.record("a", report(0, 1), &mut failures);
        assert!(data.recent_summary(0).is_none());

        data.record("a", report(1, 2), &mut failures);
        data.record("b", report(1, 3), &mut failures);
        data.record("a", report(2, 9), &mut failures);
        data.record("b", report(0, 4), &mut failures);

        let recent = data.recent_summary(0).unwrap();
        assert_eq!(recent.request_count, 5);
        assert_eq!(recent.start_time, 1_000);
        assert!(data.recent_summary(1_001).is_none());
    }
}
