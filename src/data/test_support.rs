//! A memory store whose writes can be switched to fail

use super::{MemoryDataProvider, SecurityDataProvider};
use crate::activities::SecurityActivity;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{ActivityId, EntityId, IdentityId, Membership, StoredAce, StoredSecurityEntity};
use crate::queue::CompletionState;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct FailingDataProvider {
    inner: MemoryDataProvider,
    fail_saves: AtomicBool,
    fail_entity_writes: AtomicBool,
}

impl FailingDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_entity_writes(&self, fail: bool) {
        self.fail_entity_writes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, what: &str) -> SecurityResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(SecurityError::Database(format!("{} is unavailable", what)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SecurityDataProvider for FailingDataProvider {
    async fn install_database(&self) -> SecurityResult<()> {
        self.inner.install_database().await
    }

    async fn save_activity(&self, activity: &SecurityActivity) -> SecurityResult<ActivityId> {
        Self::check(&self.fail_saves, "activity table")?;
        self.inner.save_activity(activity).await
    }

    async fn load_activities(
        &self,
        from_id: ActivityId,
        to_id: ActivityId,
        max_count: usize,
        only_unprocessed: bool,
    ) -> SecurityResult<Vec<SecurityActivity>> {
        self.inner
            .load_activities(from_id, to_id, max_count, only_unprocessed)
            .await
    }

    async fn load_activity(&self, id: ActivityId) -> SecurityResult<Option<SecurityActivity>> {
        self.inner.load_activity(id).await
    }

    async fn mark_activity_processed(&self, id: ActivityId) -> SecurityResult<()> {
        self.inner.mark_activity_processed(id).await
    }

    async fn delete_activity(&self, id: ActivityId) -> SecurityResult<bool> {
        self.inner.delete_activity(id).await
    }

    async fn load_completion_state(&self) -> SecurityResult<(CompletionState, ActivityId)> {
        self.inner.load_completion_state().await
    }

    async fn get_unprocessed_activity_ids(&self) -> SecurityResult<Vec<ActivityId>> {
        self.inner.get_unprocessed_activity_ids().await
    }

    async fn get_last_activity_id(&self) -> SecurityResult<ActivityId> {
        self.inner.get_last_activity_id().await
    }

    async fn cleanup_activities(&self, older_than_minutes: u64) -> SecurityResult<usize> {
        self.inner.cleanup_activities(older_than_minutes).await
    }

    async fn load_stored_entity(&self, id: EntityId) -> SecurityResult<Option<StoredSecurityEntity>> {
        self.inner.load_stored_entity(id).await
    }

    async fn load_all_entities(&self) -> SecurityResult<Vec<StoredSecurityEntity>> {
        self.inner.load_all_entities().await
    }

    async fn write_entity(&self, entity: &StoredSecurityEntity) -> SecurityResult<()> {
        Self::check(&self.fail_entity_writes, "entity table")?;
        self.inner.write_entity(entity).await
    }

    async fn delete_entity_tree(&self, id: EntityId) -> SecurityResult<Vec<EntityId>> {
        Self::check(&self.fail_entity_writes, "entity table")?;
        self.inner.delete_entity_tree(id).await
    }

    async fn load_all_aces(&self) -> SecurityResult<Vec<StoredAce>> {
        self.inner.load_all_aces().await
    }

    async fn write_aces(&self, aces: &[StoredAce]) -> SecurityResult<()> {
        self.inner.write_aces(aces).await
    }

    async fn remove_aces(&self, aces: &[StoredAce]) -> SecurityResult<()> {
        self.inner.remove_aces(aces).await
    }

    async fn load_all_memberships(&self) -> SecurityResult<Vec<Membership>> {
        self.inner.load_all_memberships().await
    }

    async fn add_memberships(&self, memberships: &[Membership]) -> SecurityResult<()> {
        self.inner.add_memberships(memberships).await
    }

    async fn remove_memberships(&self, memberships: &[Membership]) -> SecurityResult<()> {
        self.inner.remove_memberships(memberships).await
    }

    async fn delete_identities(&self, identities: &[IdentityId]) -> SecurityResult<()> {
        self.inner.delete_identities(identities).await
    }
}
