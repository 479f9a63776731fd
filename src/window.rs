//! # Sliding Windows
//!
//! A `Window` keeps the last `capacity` finalized snapshots in a ring and a
//! running sum of them. Inserting into a full ring unmerges the evicted
//! snapshot from the sum before merging the new one, so every insert costs a
//! single merge/unmerge pair regardless of the window size.

use crate::error::{Result, StatsError};
use crate::snapshot::Snapshot;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Largest number of samples a single window may hold
pub const MAX_CAPACITY: usize = 1 << 20;

#[derive(Debug)]
pub struct Window {
    ring: Vec<Option<Arc<Snapshot>>>,
    sum: Snapshot,
    ptr: usize,
}

impl Window {
    /// Create a window holding `capacity` snapshots (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![None; capacity.max(1)],
            sum: Snapshot::default(),
            ptr: 0,
        }
    }

    /// Size a window covering `window` for snapshots collected every `period`
    pub fn for_rule(window: Duration, period: Duration) -> Result<Self> {
        Ok(Self::new(Self::capacity_for(window, period)?))
    }

    /// Number of samples collected every `period` that cover `window`.
    ///
    /// Fails when the window holds no complete period or more than `MAX_CAPACITY` of them.
    pub fn capacity_for(window: Duration, period: Duration) -> Result<usize> {
        if period.is_zero() {
            return Err(StatsError::InvalidCollectionPeriod);
        }
        usize::try_from(window.as_nanos() / period.as_nanos())
            .ok()
            .filter(|capacity| (1..=MAX_CAPACITY).contains(capacity))
            .ok_or(StatsError::InvalidWindow { window, period })
    }

    /// Insert a finalized snapshot, evicting the oldest one when the ring is full
    pub fn add(&mut self, snapshot: Arc<Snapshot>) {
        if let Some(evicted) = self.ring[self.ptr].take() {
            if let Err(e) = self.sum.unmerge(&evicted) {
                error!(
                    error = %e,
                    sample_id = evicted.sample_id,
                    "Evicted snapshot is not part of the window sum"
                );
            }
        }
        self.sum.merge(&snapshot);
        self.ring[self.ptr] = Some(snapshot);
        self.ptr = (self.ptr + 1) % self.ring.len();
    }

    /// Whether the ring has been filled at least once
    pub fn is_full(&self) -> bool {
        self.ring[self.ptr].is_some()
    }

    /// Running sum of the snapshots currently in the ring
    pub fn sum(&self) -> &Snapshot {
        &self.sum
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Number of snapshots currently held
    pub fn len(&self) -> usize {
        self.ring.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.iter().all(Option::is_none)
    }
}
