//! # Aggregator Task
//!
//! Agent reports are delivered concurrently, but a `StatisticsStore` must see
//! them one at a time: finalizing a sample depends on the whole pending table
//! across agents. The aggregator owns the store inside a single Tokio task and
//! serializes every mutation and query through a bounded command channel.
//! Replies travel back over `oneshot` channels.
//!
//! ```rust,no_run
//! use stats_aggregator::{Aggregator, Benchmark, PhaseDef, Snapshot, StatisticsStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let benchmark = Benchmark::new("demo").with_phase(PhaseDef::new(0, "steady"));
//!     let store = StatisticsStore::new(benchmark, stats_aggregator::logging::log_failure)?;
//!     let (handle, task) = Aggregator::spawn(store);
//!
//!     handle.record("agent-1", 0, 0, "request", Snapshot::new(0)).await?;
//!     handle.complete_phase("steady").await?;
//!     handle.shutdown().await?;
//!
//!     let store = task.await?;
//!     println!("{} failures", store.failures().len());
//!     Ok(())
//! }
//! ```

use crate::data::RecordOutcome;
use crate::error::{Result, StatsError};
use crate::sla::Failure;
use crate::snapshot::Snapshot;
use crate::store::{RequestStats, StatisticsStore};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Command {
    Record {
        agent: String,
        phase_id: u32,
        step_id: u32,
        metric: String,
        snapshot: Snapshot,
        respond_to: oneshot::Sender<Result<RecordOutcome>>,
    },
    CompletePhase {
        phase: String,
        respond_to: oneshot::Sender<()>,
    },
    CompleteAll {
        respond_to: oneshot::Sender<Vec<String>>,
    },
    RecentSummary {
        min_valid_timestamp: u64,
        respond_to: oneshot::Sender<Vec<RequestStats>>,
    },
    TotalSummary {
        respond_to: oneshot::Sender<Vec<RequestStats>>,
    },
    Failures {
        respond_to: oneshot::Sender<Vec<Failure>>,
    },
    Shutdown,
}

/// Owner of a `StatisticsStore` running as a Tokio task
pub struct Aggregator {
    store: StatisticsStore,
    commands: mpsc::Receiver<Command>,
}

impl Aggregator {
    /// Move the store into a new task.
    ///
    /// The join handle yields the store back once the task stops, which happens
    /// after `shutdown` or when every handle has been dropped.
    pub fn spawn(store: StatisticsStore) -> (AggregatorHandle, JoinHandle<StatisticsStore>) {
        Self::spawn_with_capacity(store, crate::defaults::AGGREGATOR_QUEUE_DEPTH)
    }

    pub fn spawn_with_capacity(
        store: StatisticsStore,
        capacity: usize,
    ) -> (AggregatorHandle, JoinHandle<StatisticsStore>) {
        let (sender, commands) = mpsc::channel(capacity.max(1));
        let aggregator = Self { store, commands };
        let task = tokio::spawn(aggregator.run());
        (AggregatorHandle { sender }, task)
    }

    async fn run(mut self) -> StatisticsStore {
        debug!("Statistics aggregator started");
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Record {
                    agent,
                    phase_id,
                    step_id,
                    metric,
                    snapshot,
                    respond_to,
                } => {
                    let result = self
                        .store
                        .record(&agent, phase_id, step_id, &metric, snapshot);
                    if let Err(e) = &result {
                        warn!(agent = %agent, phase_id, step_id, metric = %metric, error = %e, "Cannot record statistics");
                    }
                    let _ = respond_to.send(result);
                }
                Command::CompletePhase { phase, respond_to } => {
                    self.store.complete_phase(&phase);
                    let _ = respond_to.send(());
                }
                Command::CompleteAll { respond_to } => {
                    let mut messages = Vec::new();
                    self.store.complete_all(|message| messages.push(message));
                    let _ = respond_to.send(messages);
                }
                Command::RecentSummary {
                    min_valid_timestamp,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.store.recent_summary(min_valid_timestamp));
                }
                Command::TotalSummary { respond_to } => {
                    let _ = respond_to.send(self.store.total_summary());
                }
                Command::Failures { respond_to } => {
                    let _ = respond_to.send(self.store.failures().to_vec());
                }
                Command::Shutdown => break,
            }
        }
        info!(
            failures = self.store.failures().len(),
            "Statistics aggregator stopped"
        );
        self.store
    }
}

/// Cloneable sender side of an `Aggregator`
#[derive(Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<Command>,
}

impl AggregatorHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(command(respond_to))
            .await
            .map_err(|_| StatsError::AggregatorClosed)?;
        response.await.map_err(|_| StatsError::AggregatorClosed)
    }

    pub async fn record(
        &self,
        agent: &str,
        phase_id: u32,
        step_id: u32,
        metric: &str,
        snapshot: Snapshot,
    ) -> Result<RecordOutcome> {
        self.request(|respond_to| Command::Record {
            agent: agent.to_owned(),
            phase_id,
            step_id,
            metric: metric.to_owned(),
            snapshot,
            respond_to,
        })
        .await?
    }

    pub async fn complete_phase(&self, phase: &str) -> Result<()> {
        self.request(|respond_to| Command::CompletePhase {
            phase: phase.to_owned(),
            respond_to,
        })
        .await
    }

    /// Complete every unfinished aggregate; returns a message per aggregate completed this way
    pub async fn complete_all(&self) -> Result<Vec<String>> {
        self.request(|respond_to| Command::CompleteAll { respond_to })
            .await
    }

    pub async fn recent_summary(&self, min_valid_timestamp: u64) -> Result<Vec<RequestStats>> {
        self.request(|respond_to| Command::RecentSummary {
            min_valid_timestamp,
            respond_to,
        })
        .await
    }

    pub async fn total_summary(&self) -> Result<Vec<RequestStats>> {
        self.request(|respond_to| Command::TotalSummary { respond_to })
            .await
    }

    /// Retained failures so far
    pub async fn failures(&self) -> Result<Vec<Failure>> {
        self.request(|respond_to| Command::Failures { respond_to })
            .await
    }

    /// Stop the task after the commands queued before this one
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(Command::Shutdown)
            .await
            .map_err(|_| StatsError::AggregatorClosed)
    }
}
