//! Completion checkpoint: a watermark plus the ids below it that have not
//! executed yet.

use crate::model::ActivityId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Resumable queue progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionState {
    /// Highest executed activity id
    pub last_activity_id: ActivityId,
    /// Sorted ids below the watermark not known to be executed
    pub gaps: Vec<ActivityId>,
}

impl CompletionState {
    pub fn new(last_activity_id: ActivityId, mut gaps: Vec<ActivityId>) -> Self {
        gaps.sort_unstable();
        gaps.dedup();
        gaps.retain(|g| *g < last_activity_id && *g > 0);
        Self {
            last_activity_id,
            gaps,
        }
    }

    pub fn is_completed(&self, id: ActivityId) -> bool {
        id <= self.last_activity_id && self.gaps.binary_search(&id).is_err()
    }
}

impl std::fmt::Display for CompletionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gaps: Vec<String> = self.gaps.iter().map(|g| g.to_string()).collect();
        write!(f, "{}({})", self.last_activity_id, gaps.join(","))
    }
}

/// Live completion state with the time each gap was first seen
#[derive(Debug, Default)]
pub(crate) struct CompletionTracker {
    last_activity_id: ActivityId,
    gaps: BTreeSet<ActivityId>,
    first_seen: HashMap<ActivityId, Instant>,
    /// Gaps left by activities that failed here
    failed: HashSet<ActivityId>,
}

impl CompletionTracker {
    pub fn from_state(state: &CompletionState, now: Instant) -> Self {
        Self {
            last_activity_id: state.last_activity_id,
            gaps: state.gaps.iter().copied().collect(),
            first_seen: state.gaps.iter().map(|g| (*g, now)).collect(),
            failed: HashSet::new(),
        }
    }

    pub fn state(&self) -> CompletionState {
        CompletionState {
            last_activity_id: self.last_activity_id,
            gaps: self.gaps.iter().copied().collect(),
        }
    }

    pub fn gaps(&self) -> impl Iterator<Item = ActivityId> + '_ {
        self.gaps.iter().copied()
    }

    pub fn is_completed(&self, id: ActivityId) -> bool {
        id <= self.last_activity_id && !self.gaps.contains(&id)
    }

    /// Advance the watermark to `id`, opening gaps for the skipped ids
    fn advance_to(&mut self, id: ActivityId, now: Instant) {
        for skipped in (self.last_activity_id + 1)..id {
            self.gaps.insert(skipped);
            self.first_seen.entry(skipped).or_insert(now);
        }
        self.last_activity_id = id;
    }

    pub fn record_executed(&mut self, id: ActivityId, now: Instant) {
        if id > self.last_activity_id {
            self.advance_to(id, now);
        } else {
            self.forget(id);
        }
    }

    /// An abandoned activity never executes anywhere. It closes like an
    /// executed one, so a late copy of it is ignored as a duplicate.
    pub fn record_abandoned(&mut self, id: ActivityId, now: Instant) {
        self.record_executed(id, now);
    }

    fn forget(&mut self, id: ActivityId) {
        self.gaps.remove(&id);
        self.first_seen.remove(&id);
        self.failed.remove(&id);
    }

    /// A failed activity stays open: it becomes (or remains) a gap
    pub fn record_failed(&mut self, id: ActivityId, now: Instant) {
        if id > self.last_activity_id {
            self.advance_to(id, now);
        }
        self.gaps.insert(id);
        self.first_seen.entry(id).or_insert(now);
        self.failed.insert(id);
    }

    fn is_stale(&self, id: ActivityId, now: Instant, retention: Duration) -> bool {
        self.first_seen
            .get(&id)
            .map_or(true, |seen| now.saturating_duration_since(*seen) >= retention)
    }

    /// Gaps worth reloading from the store: not in flight, and not a
    /// local failure that already outlived the retention period
    pub fn reloadable_gaps(
        &self,
        now: Instant,
        retention: Duration,
        in_flight: &HashSet<ActivityId>,
    ) -> Vec<ActivityId> {
        self.gaps
            .iter()
            .copied()
            .filter(|g| !in_flight.contains(g))
            .filter(|g| !(self.failed.contains(g) && self.is_stale(*g, now, retention)))
            .collect()
    }

    /// Drop gaps that are no longer plausible to arrive: older than
    /// `retention`, or the oldest ones beyond `max_open`. Ids in `in_flight`
    /// are still on their way and never dropped. Returns the dropped ids.
    pub fn drop_stale_gaps(
        &mut self,
        now: Instant,
        retention: Duration,
        max_open: usize,
        in_flight: &HashSet<ActivityId>,
    ) -> Vec<ActivityId> {
        let mut dropped: Vec<ActivityId> = self
            .gaps
            .iter()
            .copied()
            .filter(|g| !in_flight.contains(g))
            .filter(|g| self.is_stale(*g, now, retention))
            .collect();
        for id in &dropped {
            self.forget(*id);
        }

        if self.gaps.len() > max_open {
            let surplus = self.gaps.len() - max_open;
            let oldest: Vec<ActivityId> = self
                .gaps
                .iter()
                .copied()
                .filter(|g| !in_flight.contains(g))
                .take(surplus)
                .collect();
            for id in oldest {
                self.forget(id);
                dropped.push(id);
            }
        }
        dropped.sort_unstable();
        dropped
    }
}
