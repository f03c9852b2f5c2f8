//! Bounded record of recent arrivals for introspection.

use super::dependency::ExecutionState;
use crate::model::ActivityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub activity_id: ActivityId,
    pub name: String,
    pub state: ExecutionState,
    pub arrived_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Activity ids this one had to wait for on arrival
    pub waited_for: Vec<ActivityId>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub(crate) struct ActivityHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl ActivityHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn arrived(
        &mut self,
        activity_id: ActivityId,
        name: &str,
        state: ExecutionState,
        waited_for: Vec<ActivityId>,
    ) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            activity_id,
            name: name.to_string(),
            state,
            arrived_at: Utc::now(),
            started_at: None,
            finished_at: None,
            waited_for,
            error: None,
        });
    }

    /// Latest entry of a pending activity
    fn latest_mut(&mut self, activity_id: ActivityId) -> Option<&mut HistoryEntry> {
        self.entries
            .iter_mut()
            .rev()
            .find(|e| e.activity_id == activity_id && e.state.is_pending())
    }

    pub fn started(&mut self, activity_id: ActivityId) {
        if let Some(entry) = self.latest_mut(activity_id) {
            entry.state = ExecutionState::Executing;
            entry.started_at = Some(Utc::now());
        }
    }

    pub fn finished(&mut self, activity_id: ActivityId, state: ExecutionState, error: Option<String>) {
        if let Some(entry) = self.latest_mut(activity_id) {
            entry.state = state;
            entry.finished_at = Some(Utc::now());
            entry.error = error;
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
