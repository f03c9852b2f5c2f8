//! In-memory data provider.
//!
//! Keeps every table in ordered maps behind one mutex. Sharing one
//! `Arc<MemoryDataProvider>` between several nodes of a process gives them a
//! common store, the way a shared database does.

use super::{cleanup_limit, completion_from_flags, subtree_of, ActivityRecord, SecurityDataProvider};
use crate::activities::SecurityActivity;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{
    AceKey, ActivityId, EntityId, IdentityId, Membership, StoredAce, StoredSecurityEntity,
};
use crate::queue::CompletionState;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    last_activity_id: ActivityId,
    /// Highest id removed by the cleanup
    cleaned_up_to: ActivityId,
    activities: BTreeMap<ActivityId, ActivityRecord>,
    entities: BTreeMap<EntityId, StoredSecurityEntity>,
    aces: BTreeMap<(EntityId, AceKey), StoredAce>,
    memberships: BTreeSet<Membership>,
}

#[derive(Default)]
pub struct MemoryDataProvider {
    tables: Mutex<Tables>,
}

impl MemoryDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> SecurityResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|e| {
            error!("❌ Failed to acquire memory store lock: {}", e);
            SecurityError::LockPoisoned("memory data provider".to_string())
        })
    }

    pub fn activity_count(&self) -> SecurityResult<usize> {
        Ok(self.tables()?.activities.len())
    }
}

#[async_trait]
impl SecurityDataProvider for MemoryDataProvider {
    async fn install_database(&self) -> SecurityResult<()> {
        *self.tables()? = Tables::default();
        info!("🗄️ Installed empty in-memory security store");
        Ok(())
    }

    async fn save_activity(&self, activity: &SecurityActivity) -> SecurityResult<ActivityId> {
        let mut tables = self.tables()?;
        tables.last_activity_id += 1;
        let id = tables.last_activity_id;
        let mut saved = activity.clone();
        saved.id = id;
        saved.from_receiver = false;
        saved.from_database = false;
        tables.activities.insert(
            id,
            ActivityRecord {
                id,
                activity: saved,
                saved_at: Utc::now(),
                unprocessed: true,
            },
        );
        Ok(id)
    }

    async fn load_activities(
        &self,
        from_id: ActivityId,
        to_id: ActivityId,
        max_count: usize,
        only_unprocessed: bool,
    ) -> SecurityResult<Vec<SecurityActivity>> {
        if from_id > to_id {
            return Ok(Vec::new());
        }
        let tables = self.tables()?;
        Ok(tables
            .activities
            .range(from_id..=to_id)
            .map(|(_, record)| record)
            .filter(|record| !only_unprocessed || record.unprocessed)
            .take(max_count)
            .map(|record| record.activity.clone())
            .collect())
    }

    async fn load_activity(&self, id: ActivityId) -> SecurityResult<Option<SecurityActivity>> {
        Ok(self
            .tables()?
            .activities
            .get(&id)
            .map(|record| record.activity.clone()))
    }

    async fn mark_activity_processed(&self, id: ActivityId) -> SecurityResult<()> {
        if let Some(record) = self.tables()?.activities.get_mut(&id) {
            record.unprocessed = false;
        }
        Ok(())
    }

    async fn delete_activity(&self, id: ActivityId) -> SecurityResult<bool> {
        Ok(self.tables()?.activities.remove(&id).is_some())
    }

    async fn load_completion_state(&self) -> SecurityResult<(CompletionState, ActivityId)> {
        let tables = self.tables()?;
        let flags: Vec<(ActivityId, bool)> = tables
            .activities
            .values()
            .map(|record| (record.id, record.unprocessed))
            .collect();
        let (state, last_saved) = completion_from_flags(&flags, tables.cleaned_up_to);
        Ok((state, last_saved.max(tables.last_activity_id)))
    }

    async fn get_unprocessed_activity_ids(&self) -> SecurityResult<Vec<ActivityId>> {
        Ok(self
            .tables()?
            .activities
            .values()
            .filter(|record| record.unprocessed)
            .map(|record| record.id)
            .collect())
    }

    async fn get_last_activity_id(&self) -> SecurityResult<ActivityId> {
        Ok(self.tables()?.last_activity_id)
    }

    async fn cleanup_activities(&self, older_than_minutes: u64) -> SecurityResult<usize> {
        let Some(limit) = cleanup_limit(older_than_minutes) else {
            return Ok(0);
        };
        let mut tables = self.tables()?;
        let expired: Vec<ActivityId> = tables
            .activities
            .values()
            .filter(|record| !record.unprocessed && record.saved_at <= limit)
            .map(|record| record.id)
            .collect();
        for id in &expired {
            tables.activities.remove(id);
        }
        if let Some(highest) = expired.last() {
            tables.cleaned_up_to = tables.cleaned_up_to.max(*highest);
            debug!("Removed {} old activities up to {}", expired.len(), highest);
        }
        Ok(expired.len())
    }

    async fn load_stored_entity(&self, id: EntityId) -> SecurityResult<Option<StoredSecurityEntity>> {
        Ok(self.tables()?.entities.get(&id).copied())
    }

    async fn load_all_entities(&self) -> SecurityResult<Vec<StoredSecurityEntity>> {
        Ok(self.tables()?.entities.values().copied().collect())
    }

    async fn write_entity(&self, entity: &StoredSecurityEntity) -> SecurityResult<()> {
        self.tables()?.entities.insert(entity.id, *entity);
        Ok(())
    }

    async fn delete_entity_tree(&self, id: EntityId) -> SecurityResult<Vec<EntityId>> {
        let mut tables = self.tables()?;
        if !tables.entities.contains_key(&id) {
            return Ok(Vec::new());
        }
        let rows: Vec<StoredSecurityEntity> = tables.entities.values().copied().collect();
        let removed = subtree_of(&rows, id);
        for entity_id in &removed {
            tables.entities.remove(entity_id);
        }
        let removed_set: HashSet<EntityId> = removed.iter().copied().collect();
        tables
            .aces
            .retain(|(entity_id, _), _| !removed_set.contains(entity_id));
        Ok(removed)
    }

    async fn load_all_aces(&self) -> SecurityResult<Vec<StoredAce>> {
        Ok(self.tables()?.aces.values().copied().collect())
    }

    async fn write_aces(&self, aces: &[StoredAce]) -> SecurityResult<()> {
        let mut tables = self.tables()?;
        for ace in aces {
            tables.aces.insert((ace.entity_id, ace.key()), *ace);
        }
        Ok(())
    }

    async fn remove_aces(&self, aces: &[StoredAce]) -> SecurityResult<()> {
        let mut tables = self.tables()?;
        for ace in aces {
            tables.aces.remove(&(ace.entity_id, ace.key()));
        }
        Ok(())
    }

    async fn load_all_memberships(&self) -> SecurityResult<Vec<Membership>> {
        Ok(self.tables()?.memberships.iter().copied().collect())
    }

    async fn add_memberships(&self, memberships: &[Membership]) -> SecurityResult<()> {
        self.tables()?.memberships.extend(memberships.iter().copied());
        Ok(())
    }

    async fn remove_memberships(&self, memberships: &[Membership]) -> SecurityResult<()> {
        let mut tables = self.tables()?;
        for membership in memberships {
            tables.memberships.remove(membership);
        }
        Ok(())
    }

    async fn delete_identities(&self, identities: &[IdentityId]) -> SecurityResult<()> {
        let doomed: HashSet<IdentityId> = identities.iter().copied().collect();
        let mut tables = self.tables()?;
        tables
            .memberships
            .retain(|m| !doomed.contains(&m.group_id) && !doomed.contains(&m.member_id));
        tables
            .aces
            .retain(|_, ace| !doomed.contains(&ace.identity_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::ActivityKind;
    use crate::model::{AceInfo, EntryType, PermissionBits};

    fn delete(entity_id: EntityId) -> SecurityActivity {
        SecurityActivity::new(ActivityKind::DeleteEntity { entity_id })
    }

    #[tokio::test]
    async fn test_activity_ids_and_completion_flags() {
        let data = MemoryDataProvider::new();
        for entity_id in 1..=4 {
            data.save_activity(&delete(entity_id)).await.unwrap();
        }
        data.mark_activity_processed(1).await.unwrap();
        data.mark_activity_processed(3).await.unwrap();

        assert_eq!(data.get_last_activity_id().await.unwrap(), 4);
        assert_eq!(data.get_unprocessed_activity_ids().await.unwrap(), vec![2, 4]);
        let (state, last_saved) = data.load_completion_state().await.unwrap();
        assert_eq!(state, CompletionState::new(3, vec![2]));
        assert_eq!(last_saved, 4);

        let unprocessed = data.load_activities(1, 4, 10, true).await.unwrap();
        let ids: Vec<ActivityId> = unprocessed.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(data.load_activities(2, 4, 1, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_activity_leaves_a_hole() {
        let data = MemoryDataProvider::new();
        for entity_id in 1..=3 {
            data.save_activity(&delete(entity_id)).await.unwrap();
        }
        data.mark_activity_processed(1).await.unwrap();
        data.mark_activity_processed(3).await.unwrap();

        assert!(data.delete_activity(2).await.unwrap());
        assert!(!data.delete_activity(2).await.unwrap());
        assert!(data.load_activity(2).await.unwrap().is_none());
        assert!(data.get_unprocessed_activity_ids().await.unwrap().is_empty());
        let (state, last_saved) = data.load_completion_state().await.unwrap();
        assert_eq!(state, CompletionState::new(3, Vec::new()));
        assert_eq!(last_saved, 3);
        assert_eq!(data.save_activity(&delete(9)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_unprocessed_and_the_watermark() {
        let data = MemoryDataProvider::new();
        for entity_id in 1..=3 {
            data.save_activity(&delete(entity_id)).await.unwrap();
        }
        data.mark_activity_processed(1).await.unwrap();
        data.mark_activity_processed(3).await.unwrap();

        assert_eq!(data.cleanup_activities(0).await.unwrap(), 2);
        assert_eq!(data.activity_count().unwrap(), 1);
        let (state, last_saved) = data.load_completion_state().await.unwrap();
        assert_eq!(state, CompletionState::new(3, vec![2]));
        assert_eq!(last_saved, 3);

        assert_eq!(data.save_activity(&delete(9)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_delete_entity_tree_removes_rows_and_entries() {
        let data = MemoryDataProvider::new();
        for (id, parent) in [(1, 0), (2, 1), (3, 2), (4, 1), (5, 0)] {
            data.write_entity(&StoredSecurityEntity::new(id, parent, 1))
                .await
                .unwrap();
        }
        let ace = AceInfo::new(EntryType::Normal, 7, false)
            .with_bits(PermissionBits::from_index(0), PermissionBits::EMPTY);
        data.write_aces(&[StoredAce::new(3, &ace), StoredAce::new(5, &ace)])
            .await
            .unwrap();

        assert_eq!(data.delete_entity_tree(2).await.unwrap(), vec![2, 3]);
        let left: Vec<EntityId> = data
            .load_all_entities()
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(left, vec![1, 4, 5]);
        assert_eq!(data.load_all_aces().await.unwrap(), vec![StoredAce::new(5, &ace)]);
        assert!(data.delete_entity_tree(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_identities_removes_memberships_and_entries() {
        let data = MemoryDataProvider::new();
        data.add_memberships(&[
            Membership::user(10, 101),
            Membership::user(11, 101),
            Membership::group(10, 11),
        ])
        .await
        .unwrap();
        let ace = AceInfo::new(EntryType::Normal, 11, false)
            .with_bits(PermissionBits::from_index(1), PermissionBits::EMPTY);
        data.write_aces(&[StoredAce::new(1, &ace)]).await.unwrap();

        data.delete_identities(&[11]).await.unwrap();
        assert_eq!(
            data.load_all_memberships().await.unwrap(),
            vec![Membership::user(10, 101)]
        );
        assert!(data.load_all_aces().await.unwrap().is_empty());
    }
}
