//! # Mergeable Interval Snapshots
//!
//! A `Snapshot` aggregates the counters and the latency histogram of one
//! collection interval reported by one agent. Snapshots are combined with
//! `merge` and a previously merged contribution can be removed again with
//! `unmerge`; the two operations are exact inverses, which the sliding
//! `Window` relies on when it evicts old intervals from its running sum.
//!
//! ## Reversibility
//!
//! Every component of a snapshot is kept in a form that supports exact
//! subtraction:
//!
//! - counters are plain sums
//! - the latency histogram uses fixed bounds, so bucket layouts always match
//! - start/end timestamps are kept as counted multisets of interval bounds
//!   instead of a min/max pair
//! - extensions are a closed set of additive kinds with zero values pruned
//!
//! Min/max style extensions cannot be subtracted and are therefore not offered.

use crate::error::{Result, StatsError};
use crate::metrics::{PercentileValue, Summary};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::error;

/// Highest latency tracked by snapshot histograms (one minute, in nanoseconds)
pub const HIGHEST_TRACKABLE_NS: u64 = 60_000_000_000;

/// Precision of snapshot histograms
pub const SIGNIFICANT_DIGITS: u8 = 2;

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, HIGHEST_TRACKABLE_NS, SIGNIFICANT_DIGITS)
        .expect("constant histogram bounds are valid")
}

/// Start and end timestamps (epoch millis) of the intervals merged into a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeRange {
    starts: BTreeMap<u64, u32>,
    ends: BTreeMap<u64, u32>,
}

impl TimeRange {
    pub fn new(start: u64, end: u64) -> Self {
        let mut range = Self::default();
        range.insert(start, end);
        range
    }

    /// Earliest start of any merged interval
    pub fn start(&self) -> Option<u64> {
        self.starts.keys().next().copied()
    }

    /// Latest end of any merged interval
    pub fn end(&self) -> Option<u64> {
        self.ends.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty() && self.ends.is_empty()
    }

    fn insert(&mut self, start: u64, end: u64) {
        *self.starts.entry(start).or_insert(0) += 1;
        *self.ends.entry(end).or_insert(0) += 1;
    }

    fn add(&mut self, other: &TimeRange) {
        add_bounds(&mut self.starts, &other.starts);
        add_bounds(&mut self.ends, &other.ends);
    }

    fn contains(&self, other: &TimeRange) -> bool {
        contains_bounds(&self.starts, &other.starts) && contains_bounds(&self.ends, &other.ends)
    }

    fn remove(&mut self, other: &TimeRange) {
        remove_bounds(&mut self.starts, &other.starts);
        remove_bounds(&mut self.ends, &other.ends);
    }
}

fn add_bounds(mine: &mut BTreeMap<u64, u32>, theirs: &BTreeMap<u64, u32>) {
    for (&timestamp, &count) in theirs {
        *mine.entry(timestamp).or_insert(0) += count;
    }
}

fn contains_bounds(mine: &BTreeMap<u64, u32>, theirs: &BTreeMap<u64, u32>) -> bool {
    theirs
        .iter()
        .all(|(timestamp, &count)| mine.get(timestamp).copied().unwrap_or(0) >= count)
}

fn remove_bounds(mine: &mut BTreeMap<u64, u32>, theirs: &BTreeMap<u64, u32>) {
    for (timestamp, &count) in theirs {
        if let Some(current) = mine.get_mut(timestamp) {
            *current -= count;
            if *current == 0 {
                mine.remove(timestamp);
            }
        }
    }
}

/// Named extension value carried alongside the built-in counters.
///
/// Only additive kinds exist so that every extension can be unmerged exactly.
/// Zero values are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Extension {
    /// Independent named counters, e.g. responses per status class
    Counters(BTreeMap<String, u64>),
    /// A single additive quantity, e.g. bytes transferred
    Sum(u64),
}

impl Extension {
    pub fn is_null(&self) -> bool {
        match self {
            Extension::Counters(counters) => counters.values().all(|&v| v == 0),
            Extension::Sum(value) => *value == 0,
        }
    }

    /// Returns `false` when the two extensions are of different kinds.
    fn add(&mut self, other: &Extension) -> bool {
        match (self, other) {
            (Extension::Counters(mine), Extension::Counters(theirs)) => {
                for (name, &value) in theirs {
                    if value > 0 {
                        *mine.entry(name.clone()).or_insert(0) += value;
                    }
                }
                true
            }
            (Extension::Sum(mine), Extension::Sum(theirs)) => {
                *mine += *theirs;
                true
            }
            _ => false,
        }
    }

    fn covers(&self, other: &Extension) -> bool {
        match (self, other) {
            (Extension::Counters(mine), Extension::Counters(theirs)) => theirs
                .iter()
                .all(|(name, &value)| mine.get(name).copied().unwrap_or(0) >= value),
            (Extension::Sum(mine), Extension::Sum(theirs)) => mine >= theirs,
            _ => false,
        }
    }

    fn subtract(&mut self, other: &Extension) {
        match (self, other) {
            (Extension::Counters(mine), Extension::Counters(theirs)) => {
                for (name, &value) in theirs {
                    if let Some(current) = mine.get_mut(name) {
                        *current -= value;
                        if *current == 0 {
                            mine.remove(name);
                        }
                    }
                }
            }
            (Extension::Sum(mine), Extension::Sum(theirs)) => *mine -= *theirs,
            _ => {}
        }
    }
}

/// Mergeable aggregate of counters and latencies for one interval.
///
/// Not thread safe; owners serialize access.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Collection interval this snapshot belongs to
    pub sample_id: u32,
    pub histogram: Histogram<u64>,
    pub request_count: u64,
    pub response_count: u64,
    pub invalid: u64,
    pub connection_errors: u64,
    pub request_timeouts: u64,
    pub internal_errors: u64,
    /// Time spent waiting for a usable connection, in nanoseconds
    pub blocked_time: u64,
    time_range: TimeRange,
    extensions: BTreeMap<String, Extension>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Snapshot {
    pub fn new(sample_id: u32) -> Self {
        Self {
            sample_id,
            histogram: new_histogram(),
            request_count: 0,
            response_count: 0,
            invalid: 0,
            connection_errors: 0,
            request_timeouts: 0,
            internal_errors: 0,
            blocked_time: 0,
            time_range: TimeRange::default(),
            extensions: BTreeMap::new(),
        }
    }

    /// Create an empty snapshot covering the interval `[start, end]` (epoch millis)
    pub fn for_interval(sample_id: u32, start: u64, end: u64) -> Self {
        let mut snapshot = Self::new(sample_id);
        snapshot.time_range = TimeRange::new(start, end);
        snapshot
    }

    pub fn time_range(&self) -> &TimeRange {
        &self.time_range
    }

    pub fn start_time(&self) -> Option<u64> {
        self.time_range.start()
    }

    pub fn end_time(&self) -> Option<u64> {
        self.time_range.end()
    }

    /// Widen the covered time range to include `[start, end]`
    pub fn extend_time_range(&mut self, start: u64, end: u64) {
        self.time_range.insert(start, end);
    }

    pub fn extensions(&self) -> &BTreeMap<String, Extension> {
        &self.extensions
    }

    pub fn record_request(&mut self) {
        self.request_count += 1;
    }

    /// Record a response latency; values above one minute are clamped
    pub fn record_response(&mut self, latency: Duration) {
        let latency_ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.histogram.saturating_record(latency_ns);
        self.response_count += 1;
    }

    pub fn record_blocked(&mut self, blocked: Duration) {
        self.blocked_time += u64::try_from(blocked.as_nanos()).unwrap_or(u64::MAX);
    }

    /// Increment a named counter inside a `Counters` extension
    pub fn increment_counter(&mut self, extension: &str, counter: &str) {
        self.add_extension(
            extension,
            Extension::Counters(BTreeMap::from([(counter.to_owned(), 1)])),
        );
    }

    /// Add to a `Sum` extension
    pub fn add_to_sum(&mut self, extension: &str, value: u64) {
        self.add_extension(extension, Extension::Sum(value));
    }

    fn add_extension(&mut self, name: &str, value: Extension) {
        if value.is_null() {
            return;
        }
        match self.extensions.get_mut(name) {
            Some(mine) => {
                if !mine.add(&value) {
                    error!(extension = name, "Cannot merge extensions of different kinds");
                }
            }
            None => {
                self.extensions.insert(name.to_owned(), value);
            }
        }
    }

    /// Connection errors, timeouts and internal errors combined
    pub fn errors(&self) -> u64 {
        self.connection_errors + self.request_timeouts + self.internal_errors
    }

    pub fn is_empty(&self) -> bool {
        self.request_count
            + self.response_count
            + self.invalid
            + self.connection_errors
            + self.request_timeouts
            + self.internal_errors
            == 0
            && self.extensions.values().all(Extension::is_null)
    }

    /// Accumulate `other` into this snapshot
    pub fn merge(&mut self, other: &Snapshot) {
        if let Err(e) = self.histogram.add(&other.histogram) {
            // Both histograms share constant bounds, so this indicates a foreign histogram.
            error!(error = ?e, "Dropping latency histogram outside of snapshot bounds");
        }
        self.request_count += other.request_count;
        self.response_count += other.response_count;
        self.invalid += other.invalid;
        self.connection_errors += other.connection_errors;
        self.request_timeouts += other.request_timeouts;
        self.internal_errors += other.internal_errors;
        self.blocked_time += other.blocked_time;
        self.time_range.add(&other.time_range);
        for (name, value) in &other.extensions {
            self.add_extension(name, value.clone());
        }
    }

    /// Remove the contribution of a snapshot previously passed to `merge`.
    ///
    /// Fails without modifying this snapshot when `other` holds anything this
    /// aggregate does not.
    pub fn unmerge(&mut self, other: &Snapshot) -> Result<()> {
        if !self.contains(other) {
            return Err(StatsError::UnmergeMismatch);
        }
        self.histogram
            .subtract(&other.histogram)
            .map_err(|e| StatsError::Histogram(format!("{:?}", e)))?;
        self.request_count -= other.request_count;
        self.response_count -= other.response_count;
        self.invalid -= other.invalid;
        self.connection_errors -= other.connection_errors;
        self.request_timeouts -= other.request_timeouts;
        self.internal_errors -= other.internal_errors;
        self.blocked_time -= other.blocked_time;
        self.time_range.remove(&other.time_range);
        for (name, theirs) in &other.extensions {
            if let Some(mine) = self.extensions.get_mut(name) {
                mine.subtract(theirs);
                if mine.is_null() {
                    self.extensions.remove(name);
                }
            }
        }
        Ok(())
    }

    fn contains(&self, other: &Snapshot) -> bool {
        self.request_count >= other.request_count
            && self.response_count >= other.response_count
            && self.invalid >= other.invalid
            && self.connection_errors >= other.connection_errors
            && self.request_timeouts >= other.request_timeouts
            && self.internal_errors >= other.internal_errors
            && self.blocked_time >= other.blocked_time
            && self.time_range.contains(&other.time_range)
            && other.extensions.iter().all(|(name, theirs)| {
                self.extensions
                    .get(name)
                    .map_or(false, |mine| mine.covers(theirs))
            })
            && other.histogram.iter_recorded().all(|value| {
                self.histogram.count_at(value.value_iterated_to()) >= value.count_at_value()
            })
    }

    /// Clear all values, keeping the sample id
    pub fn reset(&mut self) {
        self.histogram.reset();
        self.request_count = 0;
        self.response_count = 0;
        self.invalid = 0;
        self.connection_errors = 0;
        self.request_timeouts = 0;
        self.internal_errors = 0;
        self.blocked_time = 0;
        self.time_range = TimeRange::default();
        self.extensions.clear();
    }

    /// Build an immutable summary resolving the given quantiles (0.0 - 1.0)
    pub fn summarize(&self, percentiles: &[f64]) -> Summary {
        let percentile_response_time = percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_ns: self.histogram.value_at_quantile(p),
            })
            .collect();

        Summary {
            start_time: self.start_time().unwrap_or(0),
            end_time: self.end_time().unwrap_or(0),
            min_response_time: self.histogram.min(),
            mean_response_time: self.histogram.mean() as u64,
            std_dev_response_time: self.histogram.stdev() as u64,
            max_response_time: self.histogram.max(),
            percentile_response_time,
            request_count: self.request_count,
            response_count: self.response_count,
            invalid: self.invalid,
            connection_errors: self.connection_errors,
            request_timeouts: self.request_timeouts,
            internal_errors: self.internal_errors,
            blocked_time: self.blocked_time,
            extensions: self.extensions.clone(),
        }
    }
}
