//! Generation bookkeeping for one `(tgid, fd)` stream key.
//!
//! A reused descriptor shows up as a higher generation; at most one
//! generation per key is ever `Collecting`.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::errors::DropReason;
use crate::metrics::TracerMetrics;

use super::tracker::{ConnTracker, ConnectionId};

#[derive(Default)]
pub struct TrackerGenerations {
    generations: BTreeMap<u64, ConnTracker>,
    newest: Option<u64>,
}

impl TrackerGenerations {
    /// Resolves the tracker for `generation`, materializing it on first
    /// sight. Events for generations older than the newest seen are
    /// refused once their tracker is gone.
    pub fn get_or_create(
        &mut self,
        tgid: u32,
        fd: u32,
        generation: u64,
        now: Instant,
        metrics: &TracerMetrics,
    ) -> Result<&mut ConnTracker, DropReason> {
        if let Some(newest) = self.newest {
            if generation < newest && !self.generations.contains_key(&generation) {
                return Err(DropReason::TooOldGeneration);
            }
            if generation > newest {
                for tracker in self.generations.values_mut() {
                    tracker.mark_ready_for_destruction("superseded by newer generation");
                }
                self.newest = Some(generation);
            }
        } else {
            self.newest = Some(generation);
        }

        Ok(self.generations.entry(generation).or_insert_with(|| {
            metrics.trackers_created.inc();
            ConnTracker::new(
                ConnectionId {
                    tgid,
                    fd,
                    generation,
                    creation_ts_ns: 0,
                },
                now,
            )
        }))
    }

    pub fn get(&self, generation: u64) -> Option<&ConnTracker> {
        self.generations.get(&generation)
    }

    pub fn trackers_mut(&mut self) -> impl Iterator<Item = &mut ConnTracker> {
        self.generations.values_mut()
    }

    pub fn trackers(&self) -> impl Iterator<Item = &ConnTracker> {
        self.generations.values()
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    /// Removes trackers whose destruction grace period has elapsed.
    pub fn remove_destroyed(&mut self, metrics: &TracerMetrics) -> usize {
        let before = self.generations.len();
        self.generations.retain(|_, tracker| !tracker.ready_for_removal());
        let removed = before - self.generations.len();
        metrics.trackers_evicted_inc("lifecycle", removed as u64);
        removed
    }

    /// Drops a specific generation outright; LRU pressure path.
    pub fn remove_generation(&mut self, generation: u64) -> bool {
        self.generations.remove(&generation).is_some()
    }
}
