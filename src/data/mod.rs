//! # Data Collaborator
//!
//! Durable storage of activities, entity rows, explicit entries and
//! memberships. The core only talks to the [`SecurityDataProvider`] trait;
//! [`memory::MemoryDataProvider`] serves single-process setups and tests,
//! [`sled_store::SledDataProvider`] keeps everything in sled trees.
//!
//! Activity ids are assigned by `save_activity` and grow monotonically.
//! Every saved activity starts unprocessed and stays so until
//! `mark_activity_processed` is called for it. An abandoned activity is
//! deleted, which leaves a hole in the id sequence.

pub mod memory;
pub mod sled_store;
#[cfg(test)]
pub(crate) mod test_support;

pub use memory::MemoryDataProvider;
pub use sled_store::SledDataProvider;

use crate::activities::SecurityActivity;
use crate::error::SecurityResult;
use crate::model::{ActivityId, EntityId, IdentityId, Membership, StoredAce, StoredSecurityEntity};
use crate::queue::CompletionState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A saved activity together with its bookkeeping columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: ActivityId,
    pub activity: SecurityActivity,
    pub saved_at: DateTime<Utc>,
    pub unprocessed: bool,
}

#[async_trait]
pub trait SecurityDataProvider: Send + Sync {
    /// Create the empty schema; existing data is discarded
    async fn install_database(&self) -> SecurityResult<()>;

    /// Persist a new activity and return its assigned id
    async fn save_activity(&self, activity: &SecurityActivity) -> SecurityResult<ActivityId>;

    /// Activities with `from_id <= id <= to_id` in id order, at most
    /// `max_count` of them
    async fn load_activities(
        &self,
        from_id: ActivityId,
        to_id: ActivityId,
        max_count: usize,
        only_unprocessed: bool,
    ) -> SecurityResult<Vec<SecurityActivity>>;

    async fn load_activity(&self, id: ActivityId) -> SecurityResult<Option<SecurityActivity>>;

    async fn mark_activity_processed(&self, id: ActivityId) -> SecurityResult<()>;

    /// Remove a saved activity that must never execute, e.g. one whose
    /// caller gave up before it was dispatched. Returns whether it existed.
    async fn delete_activity(&self, id: ActivityId) -> SecurityResult<bool>;

    /// Completion state derived from the stored flags, and the highest
    /// saved id
    async fn load_completion_state(&self) -> SecurityResult<(CompletionState, ActivityId)>;

    async fn get_unprocessed_activity_ids(&self) -> SecurityResult<Vec<ActivityId>>;

    async fn get_last_activity_id(&self) -> SecurityResult<ActivityId>;

    /// Remove processed activities older than the given age. Returns the
    /// number removed.
    async fn cleanup_activities(&self, older_than_minutes: u64) -> SecurityResult<usize>;

    async fn load_stored_entity(&self, id: EntityId) -> SecurityResult<Option<StoredSecurityEntity>>;

    async fn load_all_entities(&self) -> SecurityResult<Vec<StoredSecurityEntity>>;

    /// Insert or overwrite an entity row
    async fn write_entity(&self, entity: &StoredSecurityEntity) -> SecurityResult<()>;

    /// Remove the entity, every row below it and their entries
    async fn delete_entity_tree(&self, id: EntityId) -> SecurityResult<Vec<EntityId>>;

    async fn load_all_aces(&self) -> SecurityResult<Vec<StoredAce>>;

    /// Upsert entries by (entity, entry type, identity, local-only)
    async fn write_aces(&self, aces: &[StoredAce]) -> SecurityResult<()>;

    /// Remove entries by key; the bit columns are ignored
    async fn remove_aces(&self, aces: &[StoredAce]) -> SecurityResult<()>;

    async fn load_all_memberships(&self) -> SecurityResult<Vec<Membership>>;

    async fn add_memberships(&self, memberships: &[Membership]) -> SecurityResult<()>;

    async fn remove_memberships(&self, memberships: &[Membership]) -> SecurityResult<()>;

    /// Remove every membership and entry that refers to the identities
    async fn delete_identities(&self, identities: &[IdentityId]) -> SecurityResult<()>;
}

/// Load `[from_id, to_id]` in batches of `batch` activities
pub async fn load_activity_range(
    data: &dyn SecurityDataProvider,
    from_id: ActivityId,
    to_id: ActivityId,
    batch: usize,
) -> SecurityResult<Vec<SecurityActivity>> {
    let mut result = Vec::new();
    let mut next = from_id;
    while next <= to_id {
        let loaded = data.load_activities(next, to_id, batch.max(1), false).await?;
        let Some(last) = loaded.last().map(|a| a.id) else {
            break;
        };
        result.extend(loaded);
        next = last + 1;
    }
    Ok(result)
}

/// `root` and every row below it, sorted. Rows may arrive in any order.
pub(crate) fn subtree_of(rows: &[StoredSecurityEntity], root: EntityId) -> Vec<EntityId> {
    let mut removed = vec![root];
    let mut seen: HashSet<EntityId> = HashSet::from([root]);
    let mut index = 0;
    while index < removed.len() {
        let parent = removed[index];
        for row in rows {
            if row.parent_id == parent && seen.insert(row.id) {
                removed.push(row.id);
            }
        }
        index += 1;
    }
    removed.sort_unstable();
    removed
}

/// Save time before which processed activities may be cleaned up.
/// `None` when the age reaches before any representable time.
pub(crate) fn cleanup_limit(older_than_minutes: u64) -> Option<DateTime<Utc>> {
    let age = std::time::Duration::from_secs(older_than_minutes.saturating_mul(60));
    let age = chrono::Duration::from_std(age).ok()?;
    Utc::now().checked_sub_signed(age)
}

/// Derive a completion state from `(id, unprocessed)` pairs sorted by id.
///
/// The watermark is the highest processed id, or `cleaned_up_to` when the
/// cleanup already removed processed activities above it. Unprocessed ids
/// below the watermark are gaps.
pub(crate) fn completion_from_flags(
    flags: &[(ActivityId, bool)],
    cleaned_up_to: ActivityId,
) -> (CompletionState, ActivityId) {
    let last_saved = flags
        .last()
        .map(|(id, _)| *id)
        .unwrap_or(0)
        .max(cleaned_up_to);
    let last_processed = flags
        .iter()
        .filter(|(_, unprocessed)| !unprocessed)
        .map(|(id, _)| *id)
        .max()
        .unwrap_or(0)
        .max(cleaned_up_to);
    let gaps = flags
        .iter()
        .filter(|(id, unprocessed)| *unprocessed && *id < last_processed)
        .map(|(id, _)| *id)
        .collect();
    (CompletionState::new(last_processed, gaps), last_saved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_from_flags() {
        let flags = vec![(1, false), (2, true), (3, false), (4, true)];
        let (state, last_saved) = completion_from_flags(&flags, 0);
        assert_eq!(state.last_activity_id, 3);
        assert_eq!(state.gaps, vec![2]);
        assert_eq!(last_saved, 4);

        let (empty, last) = completion_from_flags(&[], 0);
        assert_eq!(empty, CompletionState::default());
        assert_eq!(last, 0);
    }

    #[test]
    fn test_completion_survives_cleanup() {
        let (state, last_saved) = completion_from_flags(&[(7, true), (9, true)], 8);
        assert_eq!(state, CompletionState::new(8, vec![7]));
        assert_eq!(last_saved, 9);
    }
}
