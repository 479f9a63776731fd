//! # Pool Statistics
//!
//! Besides request statistics, agents periodically report the low and high
//! water marks of their session pools (per phase) and connection pools (per
//! authority and connection type), and a CPU usage description per phase.
//! `PoolStats` keeps these records per agent and summarizes them for recent
//! and whole-run reporting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Low and high water mark of a pool over some period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowHigh {
    pub low: u32,
    pub high: u32,
}

impl LowHigh {
    pub fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    /// Pools of different agents observed at the same time
    pub fn sum(self, other: LowHigh) -> LowHigh {
        LowHigh::new(self.low + other.low, self.high + other.high)
    }

    /// The same pool observed over consecutive periods
    pub fn combine(self, other: LowHigh) -> LowHigh {
        LowHigh::new(self.low.min(other.low), self.high.max(other.high))
    }
}

impl fmt::Display for LowHigh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolRecord {
    timestamp: u64,
    value: LowHigh,
}

type AgentRecords = BTreeMap<String, Vec<PoolRecord>>;

/// Session pool, connection pool and CPU usage records of all agents
#[derive(Debug, Default)]
pub struct PoolStats {
    /// phase -> agent -> records
    sessions: BTreeMap<String, AgentRecords>,
    /// authority -> connection type -> agent -> records
    connections: BTreeMap<String, BTreeMap<String, AgentRecords>>,
    /// phase -> agent -> usage
    cpu_usage: BTreeMap<String, BTreeMap<String, String>>,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sessions(&mut self, agent: &str, timestamp: u64, phase: &str, min: u32, max: u32) {
        self.sessions
            .entry(phase.to_owned())
            .or_default()
            .entry(agent.to_owned())
            .or_default()
            .push(PoolRecord {
                timestamp,
                value: LowHigh::new(min, max),
            });
    }

    /// Latest session pool range of each agent, per phase, if not older than `min_valid_timestamp`
    pub fn recent_session_summary(
        &self,
        min_valid_timestamp: u64,
    ) -> BTreeMap<String, BTreeMap<String, LowHigh>> {
        summarize_sessions(&self.sessions, |records| {
            records
                .last()
                .filter(|record| record.timestamp >= min_valid_timestamp)
                .map(|record| record.value)
        })
    }

    /// Lowest and highest session count of each agent over the whole phase
    pub fn total_session_summary(&self) -> BTreeMap<String, BTreeMap<String, LowHigh>> {
        summarize_sessions(&self.sessions, |records| {
            let low = records.iter().map(|r| r.value.low).min()?;
            let high = records.iter().map(|r| r.value.high).max()?;
            Some(LowHigh::new(low, high))
        })
    }

    /// Extremes of the session count summed over all agents.
    ///
    /// Agents' records are walked in lockstep, the n-th record of every agent
    /// being treated as simultaneous.
    pub fn session_min_max(&self, phase: &str) -> Option<LowHigh> {
        let agents = self.sessions.get(phase)?;
        let longest = agents.values().map(Vec::len).max()?;
        (0..longest)
            .filter_map(|i| sum_at(agents.values(), i))
            .reduce(LowHigh::combine)
    }

    pub fn record_connections(
        &mut self,
        agent: &str,
        timestamp: u64,
        stats: &BTreeMap<String, BTreeMap<String, LowHigh>>,
    ) {
        for (authority, by_type) in stats {
            for (connection_type, &value) in by_type {
                self.connections
                    .entry(authority.clone())
                    .or_default()
                    .entry(connection_type.clone())
                    .or_default()
                    .entry(agent.to_owned())
                    .or_default()
                    .push(PoolRecord { timestamp, value });
            }
        }
    }

    /// Sum of every agent's latest connection pool range.
    ///
    /// A connection type is left out entirely when any agent's latest record is
    /// older than `min_valid_timestamp`.
    pub fn recent_connections_summary(
        &self,
        min_valid_timestamp: u64,
    ) -> BTreeMap<String, BTreeMap<String, LowHigh>> {
        let mut summary: BTreeMap<String, BTreeMap<String, LowHigh>> = BTreeMap::new();
        for (authority, by_type) in &self.connections {
            for (connection_type, agents) in by_type {
                let latest: Vec<&PoolRecord> = agents.values().filter_map(|r| r.last()).collect();
                if latest.iter().any(|r| r.timestamp < min_valid_timestamp) {
                    continue;
                }
                if let Some(sum) = latest.iter().map(|r| r.value).reduce(LowHigh::sum) {
                    summary
                        .entry(authority.clone())
                        .or_default()
                        .insert(connection_type.clone(), sum);
                }
            }
        }
        summary
    }

    /// Extremes of the connection count summed over all agents, walked in lockstep
    pub fn total_connections_summary(&self) -> BTreeMap<String, BTreeMap<String, LowHigh>> {
        let mut summary: BTreeMap<String, BTreeMap<String, LowHigh>> = BTreeMap::new();
        for (authority, by_type) in &self.connections {
            for (connection_type, agents) in by_type {
                let longest = agents.values().map(Vec::len).max().unwrap_or(0);
                let total = (0..longest)
                    .filter_map(|i| sum_at(agents.values(), i))
                    .reduce(LowHigh::combine);
                if let Some(total) = total {
                    summary
                        .entry(authority.clone())
                        .or_default()
                        .insert(connection_type.clone(), total);
                }
            }
        }
        summary
    }

    /// Keep the first usage reported by each agent for a phase
    pub fn record_cpu_usage(&mut self, phase: &str, agent: &str, usage: &str) {
        self.cpu_usage
            .entry(phase.to_owned())
            .or_default()
            .entry(agent.to_owned())
            .or_insert_with(|| usage.to_owned());
    }

    pub fn cpu_usage(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.cpu_usage
    }
}

fn sum_at<'a>(agents: impl Iterator<Item = &'a Vec<PoolRecord>>, index: usize) -> Option<LowHigh> {
    agents
        .filter_map(|records| records.get(index))
        .map(|record| record.value)
        .reduce(LowHigh::sum)
}

fn summarize_sessions(
    sessions: &BTreeMap<String, AgentRecords>,
    summarize: impl Fn(&[PoolRecord]) -> Option<LowHigh>,
) -> BTreeMap<String, BTreeMap<String, LowHigh>> {
    sessions
        .iter()
        .filter_map(|(phase, agents)| {
            let by_agent: BTreeMap<String, LowHigh> = agents
                .iter()
                .filter_map(|(agent, records)| Some((agent.clone(), summarize(records.as_slice())?)))
                .collect();
            (!by_agent.is_empty()).then(|| (phase.clone(), by_agent))
        })
        .collect()
}
