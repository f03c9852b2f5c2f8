//! Wait graph of in-flight activities.
//!
//! Nodes live in an arena keyed by arrival sequence. Edges are stored on
//! both ends (`waiting_for` / `waiting_for_me`) as arena keys, so removing a
//! finished node touches only its direct dependents. A new node can only wait
//! for nodes that arrived before it, which keeps the graph acyclic.

use crate::activities::AffectedIds;
use crate::error::{SecurityError, SecurityResult};
use crate::model::ActivityId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Arrival sequence number of a node
pub type NodeKey = u64;

/// Lifecycle of an activity inside the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Waiting,
    Ready,
    Executing,
    Released,
    IgnoredDuplicate,
    Failed,
    Cancelled,
}

impl ExecutionState {
    /// Still occupying a place in the wait graph
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ExecutionState::Waiting | ExecutionState::Ready | ExecutionState::Executing
        )
    }
}

#[derive(Debug)]
pub(crate) struct GraphNode {
    pub activity_id: ActivityId,
    pub uuid: Uuid,
    pub name: &'static str,
    pub affected: AffectedIds,
    pub state: ExecutionState,
    pub waiting_for: HashSet<NodeKey>,
    pub waiting_for_me: HashSet<NodeKey>,
}

#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    next_key: NodeKey,
    nodes: BTreeMap<NodeKey, GraphNode>,
}

impl DependencyGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: NodeKey) -> Option<&GraphNode> {
        self.nodes.get(&key)
    }

    /// Node of a saved activity id, or of the activity object itself
    pub fn find(&self, activity_id: ActivityId, uuid: Uuid) -> Option<NodeKey> {
        self.nodes
            .iter()
            .find(|(_, node)| {
                node.uuid == uuid || (activity_id != 0 && node.activity_id == activity_id)
            })
            .map(|(key, _)| *key)
    }

    pub fn activity_ids(&self) -> HashSet<ActivityId> {
        self.nodes.values().map(|n| n.activity_id).collect()
    }

    fn add_edge(&mut self, waiter: NodeKey, blocker: NodeKey) -> SecurityResult<()> {
        if waiter == blocker {
            return Err(SecurityError::Internal(format!(
                "node {} cannot wait for itself",
                waiter
            )));
        }
        let blocker_node = self
            .nodes
            .get_mut(&blocker)
            .ok_or_else(|| SecurityError::Internal(format!("unknown blocker node {}", blocker)))?;
        blocker_node.waiting_for_me.insert(waiter);
        let waiter_node = self
            .nodes
            .get_mut(&waiter)
            .ok_or_else(|| SecurityError::Internal(format!("unknown waiting node {}", waiter)))?;
        waiter_node.waiting_for.insert(blocker);
        Ok(())
    }

    /// Add a node and wire it to every conflicting pending node.
    /// The node starts `Ready` when it waits for nothing.
    pub fn insert(
        &mut self,
        activity_id: ActivityId,
        uuid: Uuid,
        name: &'static str,
        affected: AffectedIds,
    ) -> SecurityResult<NodeKey> {
        let key = self.next_key;
        self.next_key += 1;
        let blockers: Vec<NodeKey> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.state.is_pending() && node.affected.conflicts_with(&affected))
            .map(|(k, _)| *k)
            .collect();
        self.nodes.insert(
            key,
            GraphNode {
                activity_id,
                uuid,
                name,
                affected,
                state: ExecutionState::Ready,
                waiting_for: HashSet::new(),
                waiting_for_me: HashSet::new(),
            },
        );
        for blocker in blockers {
            self.add_edge(key, blocker)?;
        }
        if let Some(node) = self.nodes.get_mut(&key) {
            if !node.waiting_for.is_empty() {
                node.state = ExecutionState::Waiting;
            }
        }
        Ok(key)
    }

    pub fn set_state(&mut self, key: NodeKey, state: ExecutionState) {
        if let Some(node) = self.nodes.get_mut(&key) {
            node.state = state;
        }
    }

    /// Activity ids a node still waits for
    pub fn blockers_of(&self, key: NodeKey) -> Vec<ActivityId> {
        let mut ids: Vec<ActivityId> = self
            .nodes
            .get(&key)
            .map(|node| {
                node.waiting_for
                    .iter()
                    .filter_map(|k| self.nodes.get(k))
                    .map(|n| n.activity_id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Remove a node and unlink it from its dependents. Returns the
    /// dependents that have nothing left to wait for, now `Ready`.
    pub fn remove(&mut self, key: NodeKey) -> Vec<NodeKey> {
        let Some(node) = self.nodes.remove(&key) else {
            return Vec::new();
        };
        for blocker in &node.waiting_for {
            if let Some(b) = self.nodes.get_mut(blocker) {
                b.waiting_for_me.remove(&key);
            }
        }
        let mut released = Vec::new();
        for dependent in &node.waiting_for_me {
            if let Some(d) = self.nodes.get_mut(dependent) {
                d.waiting_for.remove(&key);
                if d.waiting_for.is_empty() && d.state == ExecutionState::Waiting {
                    d.state = ExecutionState::Ready;
                    released.push(*dependent);
                }
            }
        }
        released.sort_unstable();
        released
    }

    /// `(activity id, state)` of every node in arrival order
    pub fn snapshot(&self) -> Vec<(ActivityId, ExecutionState)> {
        self.nodes
            .values()
            .map(|n| (n.activity_id, n.state))
            .collect()
    }
}
