//! # Benchmark Definition
//!
//! The already-parsed benchmark model the statistics store consumes: phases
//! with their warm-up flag and per-metric SLA rules, SLA rules bound to steps,
//! and the statistics collection period used to size sliding windows.
//!
//! The model is normally produced by the benchmark parser; it can also be
//! assembled with the builder methods or loaded from JSON:
//!
//! ```json
//! {
//!   "name": "checkout",
//!   "statistics_collection_period": "1s",
//!   "phases": [
//!     { "id": 0, "name": "steady", "custom_slas": {
//!         "checkout": [ { "checks": [ { "check": "error_ratio", "max": 0.01 } ] } ] } }
//!   ],
//!   "step_slas": { "3": [ { "window": "10s", "checks": [] } ] }
//! }
//! ```

use crate::config::duration_str;
use crate::error::{Result, StatsError};
use crate::sla::SlaRule;
use crate::window::Window;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_collection_period() -> Duration {
    crate::defaults::COLLECTION_PERIOD
}

/// A phase of the benchmark as seen by the statistics engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDef {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub is_warmup: bool,
    /// SLA rules applied to metrics recorded with step id 0, by metric name
    #[serde(default)]
    pub custom_slas: HashMap<String, Vec<SlaRule>>,
}

impl PhaseDef {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_warmup: false,
            custom_slas: HashMap::new(),
        }
    }

    pub fn warmup(mut self) -> Self {
        self.is_warmup = true;
        self
    }

    pub fn with_sla(mut self, metric: impl Into<String>, rule: SlaRule) -> Self {
        self.custom_slas.entry(metric.into()).or_default().push(rule);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub name: String,
    /// Length of one sample tick
    #[serde(default = "default_collection_period", with = "duration_str")]
    pub statistics_collection_period: Duration,
    #[serde(default)]
    pub phases: Vec<PhaseDef>,
    /// SLA rules of steps that provide them, by step id
    #[serde(default)]
    pub step_slas: HashMap<u32, Vec<SlaRule>>,
}

impl Benchmark {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statistics_collection_period: crate::defaults::COLLECTION_PERIOD,
            phases: Vec::new(),
            step_slas: HashMap::new(),
        }
    }

    pub fn with_collection_period(mut self, period: Duration) -> Self {
        self.statistics_collection_period = period;
        self
    }

    pub fn with_phase(mut self, phase: PhaseDef) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn with_step_sla(mut self, step_id: u32, rule: SlaRule) -> Self {
        self.step_slas.entry(step_id).or_default().push(rule);
        self
    }

    pub fn phase_by_id(&self, id: u32) -> Result<&PhaseDef> {
        self.phases
            .iter()
            .find(|phase| phase.id == id)
            .ok_or(StatsError::UnknownPhase(id))
    }

    pub fn phase_by_name(&self, name: &str) -> Result<&PhaseDef> {
        self.phases
            .iter()
            .find(|phase| phase.name == name)
            .ok_or_else(|| StatsError::UnknownPhaseName(name.to_owned()))
    }

    pub fn step_slas(&self, step_id: u32) -> &[SlaRule] {
        self.step_slas.get(&step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// SLA rules bound to statistics of the given phase, step and metric.
    ///
    /// Step 0 denotes metrics recorded outside of any step; those use the
    /// phase's per-metric rules, all others the rules provided by the step.
    pub fn rules_for<'a>(&'a self, phase: &'a PhaseDef, step_id: u32, metric: &str) -> &'a [SlaRule] {
        if step_id != 0 {
            self.step_slas(step_id)
        } else {
            phase.custom_slas.get(metric).map(Vec::as_slice).unwrap_or(&[])
        }
    }

    /// Check the definition for problems that would otherwise surface on first record
    pub fn validate(&self) -> Result<()> {
        if self.statistics_collection_period.is_zero() {
            return Err(StatsError::InvalidCollectionPeriod);
        }
        let rules = self
            .phases
            .iter()
            .flat_map(|phase| phase.custom_slas.values())
            .chain(self.step_slas.values())
            .flatten();
        for rule in rules {
            rule.check_definition()?;
            if rule.is_windowed() {
                Window::capacity_for(rule.window(), self.statistics_collection_period)?;
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let benchmark: Self =
            serde_json::from_str(json).context("Failed to parse benchmark definition")?;
        benchmark.validate()?;
        Ok(benchmark)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read benchmark definition {:?}", path))?;
        Self::from_json_str(&json).with_context(|| format!("Invalid benchmark definition in {:?}", path))
    }
}
