//! # Security System
//!
//! The handle that owns one node's security engine: the entity tree cache,
//! the activity queue, and the background tasks that receive activities
//! from other nodes and run the periodic health check.
//!
//! Structural and ACL changes go through the queue and return once the
//! activity has executed locally. Permission queries evaluate directly
//! against the cache under its read lock.
//!
//! ```text
//! start() ──► load rows ──► build cache ──► queue.startup() ──► operational
//!                                                                   │
//!        shutdown() ◄── drain queue ◄── refuse arrivals ◄───────────┘
//! ```

use crate::acl_editor::AclEditor;
use crate::activities::{ActivityKind, SecurityActivity};
use crate::cache::{CacheState, MissingEntityHandler, SecurityCache};
use crate::config::SecurityConfig;
use crate::data::SecurityDataProvider;
use crate::error::{SecurityError, SecurityResult};
use crate::evaluator::{PermissionEvaluator, SpecialGroups};
use crate::messaging::{resolve_message, Envelope, MessageProvider};
use crate::model::{
    require_id, AccessControlList, AceInfo, ActivityId, EntityId, EntryType, EntryTypeSet,
    IdentityId, PermissionLevel, PermissionType, PermissionValue, SecurityEntity,
};
use crate::queue::{
    ActivityQueue, CompletionState, HealthReport, HistoryEntry, QueueSettings, QueueSnapshot,
};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct SystemInner {
    config: SecurityConfig,
    cache: Arc<SecurityCache>,
    data: Arc<dyn SecurityDataProvider>,
    messaging: Arc<dyn MessageProvider>,
    queue: ActivityQueue,
    special: SpecialGroups,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Clonable handle of a running security node
#[derive(Clone)]
pub struct SecuritySystem {
    inner: Arc<SystemInner>,
}

impl SecuritySystem {
    /// Load the persisted state, recover unfinished activities and start
    /// listening for activities of other nodes.
    pub async fn start(
        config: SecurityConfig,
        data: Arc<dyn SecurityDataProvider>,
        messaging: Arc<dyn MessageProvider>,
    ) -> SecurityResult<Self> {
        Self::start_with_resolver(config, data, messaging, None).await
    }

    /// Like [`SecuritySystem::start`], consulting `resolver` for entities
    /// that are not in the store when they are first requested.
    pub async fn start_with_resolver(
        config: SecurityConfig,
        data: Arc<dyn SecurityDataProvider>,
        messaging: Arc<dyn MessageProvider>,
        resolver: Option<Arc<dyn MissingEntityHandler>>,
    ) -> SecurityResult<Self> {
        config.validate()?;
        info!("🚀 Starting security system on node {}", messaging.node_id());

        let entities = data.load_all_entities().await?;
        let aces = data.load_all_aces().await?;
        let memberships = data.load_all_memberships().await?;
        let cache = Arc::new(SecurityCache::new(CacheState::build(
            entities,
            aces,
            memberships,
        )));
        if let Some(resolver) = resolver {
            cache.set_missing_entity_handler(resolver)?;
        }

        let queue = ActivityQueue::new(
            Arc::clone(&cache),
            Arc::clone(&data),
            Arc::clone(&messaging),
            QueueSettings::from_config(&config),
        );
        let (completion, last_saved) = data.load_completion_state().await?;
        queue.startup(completion, last_saved).await?;

        let special = SpecialGroups {
            owner_group_id: config.owner_group_id,
            everyone_group_id: config.everyone_group_id,
        };
        let system = Self {
            inner: Arc::new(SystemInner {
                config,
                cache,
                data,
                messaging,
                queue,
                special,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        system.spawn_background_tasks()?;
        info!("✅ Security system operational");
        Ok(system)
    }

    fn spawn_background_tasks(&self) -> SecurityResult<()> {
        let mut tasks = self.tasks()?;
        if let Some(receiver) = self.inner.messaging.take_receiver() {
            tasks.push(tokio::spawn(receive_loop(
                self.inner.queue.clone(),
                Arc::clone(&self.inner.data),
                Arc::clone(&self.inner.messaging),
                receiver,
            )));
        }
        if let Some(interval) = self.inner.config.health_check_interval() {
            let queue = self.inner.queue.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !queue.is_operational() {
                        break;
                    }
                    if let Err(e) = queue.health_check().await {
                        warn!("⚠️ Periodic health check failed: {}", e);
                    }
                }
            }));
        }
        Ok(())
    }

    fn tasks(&self) -> SecurityResult<std::sync::MutexGuard<'_, Vec<JoinHandle<()>>>> {
        self.inner.tasks.lock().map_err(|e| {
            error!("❌ Failed to acquire background task lock: {}", e);
            SecurityError::LockPoisoned("background tasks".to_string())
        })
    }

    pub fn is_operational(&self) -> bool {
        self.inner.queue.is_operational()
    }

    fn ensure_operational(&self) -> SecurityResult<()> {
        if self.is_operational() {
            Ok(())
        } else {
            Err(SecurityError::NotOperational)
        }
    }

    pub fn node_id(&self) -> &str {
        self.inner.messaging.node_id()
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.inner.config
    }

    /// Stop accepting work, drain the queue and stop the background tasks.
    /// Later calls fail with `NotOperational`.
    pub async fn shutdown(&self) -> SecurityResult<()> {
        info!("🛑 Shutting down security system on node {}", self.node_id());
        self.inner.queue.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks()?.drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        join_all(tasks).await;
        info!("✅ Security system stopped");
        Ok(())
    }

    async fn submit(&self, kind: ActivityKind) -> SecurityResult<ActivityId> {
        self.ensure_operational()?;
        let activity = SecurityActivity::new(kind);
        activity.validate()?;
        self.inner.queue.execute_local(activity).await
    }

    fn require_entity(&self, entity_id: EntityId) -> SecurityResult<()> {
        require_id(entity_id, "entity id")?;
        if !self.inner.cache.ensure_entity(entity_id)? {
            return Err(SecurityError::EntityNotFound(entity_id));
        }
        Ok(())
    }

    // ========== ENTITY TREE ==========

    /// Create an entity under `parent_id`, or a root when it is zero
    pub async fn create_entity(
        &self,
        entity_id: EntityId,
        parent_id: EntityId,
        owner_id: IdentityId,
    ) -> SecurityResult<ActivityId> {
        self.ensure_operational()?;
        require_id(entity_id, "entity id")?;
        require_id(owner_id, "owner id")?;
        if parent_id != 0 {
            self.require_entity(parent_id)?;
        }
        self.submit(ActivityKind::CreateEntity {
            entity_id,
            parent_id,
            owner_id,
        })
        .await
    }

    /// Delete the entity with its subtree. Unknown entities are a no-op.
    pub async fn delete_entity(&self, entity_id: EntityId) -> SecurityResult<ActivityId> {
        self.submit(ActivityKind::DeleteEntity { entity_id }).await
    }

    pub async fn move_entity(
        &self,
        source_id: EntityId,
        target_id: EntityId,
    ) -> SecurityResult<ActivityId> {
        self.ensure_operational()?;
        self.require_entity(source_id)?;
        self.require_entity(target_id)?;
        {
            let state = self.inner.cache.read()?;
            if source_id == target_id || state.is_descendant_of(target_id, source_id) {
                return Err(SecurityError::invalid_argument(format!(
                    "Cannot move entity {} under its own subtree ({})",
                    source_id, target_id
                )));
            }
        }
        self.submit(ActivityKind::MoveEntity {
            source_id,
            target_id,
        })
        .await
    }

    pub async fn modify_owner(
        &self,
        entity_id: EntityId,
        owner_id: IdentityId,
    ) -> SecurityResult<ActivityId> {
        self.ensure_operational()?;
        require_id(owner_id, "owner id")?;
        self.require_entity(entity_id)?;
        self.submit(ActivityKind::ModifyOwner {
            entity_id,
            owner_id,
        })
        .await
    }

    pub fn get_entity(&self, entity_id: EntityId) -> SecurityResult<Option<SecurityEntity>> {
        self.ensure_operational()?;
        self.inner.cache.ensure_entity(entity_id)?;
        Ok(self.inner.cache.read()?.get_entity(entity_id).cloned())
    }

    pub fn get_first_acl_holder(&self, entity_id: EntityId) -> SecurityResult<Option<EntityId>> {
        self.ensure_operational()?;
        self.require_entity(entity_id)?;
        Ok(self.inner.cache.read()?.get_first_acl_holder(entity_id))
    }

    // ========== ACL EDITING ==========

    pub fn create_acl_editor(&self, entry_type: EntryType) -> SecurityResult<AclEditor> {
        self.ensure_operational()?;
        Ok(AclEditor::new(
            Arc::clone(&self.inner.cache),
            self.inner.queue.clone(),
            entry_type,
        ))
    }

    // ========== MEMBERSHIP ==========

    pub async fn add_members_to_group(
        &self,
        group_id: IdentityId,
        user_members: &[IdentityId],
        group_members: &[IdentityId],
        parent_groups: &[IdentityId],
    ) -> SecurityResult<ActivityId> {
        self.submit(ActivityKind::AddMembersToGroup {
            group_id,
            user_members: user_members.to_vec(),
            group_members: group_members.to_vec(),
            parent_groups: parent_groups.to_vec(),
        })
        .await
    }

    pub async fn remove_members_from_group(
        &self,
        group_id: IdentityId,
        user_members: &[IdentityId],
        group_members: &[IdentityId],
        parent_groups: &[IdentityId],
    ) -> SecurityResult<ActivityId> {
        self.submit(ActivityKind::RemoveMembersFromGroup {
            group_id,
            user_members: user_members.to_vec(),
            group_members: group_members.to_vec(),
            parent_groups: parent_groups.to_vec(),
        })
        .await
    }

    pub async fn add_user_to_groups(
        &self,
        user_id: IdentityId,
        parent_groups: &[IdentityId],
    ) -> SecurityResult<ActivityId> {
        self.submit(ActivityKind::AddUserToSecurityGroups {
            user_id,
            parent_groups: parent_groups.to_vec(),
        })
        .await
    }

    pub async fn remove_user_from_groups(
        &self,
        user_id: IdentityId,
        parent_groups: &[IdentityId],
    ) -> SecurityResult<ActivityId> {
        self.submit(ActivityKind::RemoveUserFromSecurityGroups {
            user_id,
            parent_groups: parent_groups.to_vec(),
        })
        .await
    }

    pub async fn delete_user(&self, user_id: IdentityId) -> SecurityResult<ActivityId> {
        self.submit(ActivityKind::DeleteUser { user_id }).await
    }

    pub async fn delete_group(&self, group_id: IdentityId) -> SecurityResult<ActivityId> {
        self.submit(ActivityKind::DeleteGroup { group_id }).await
    }

    pub async fn delete_identities(&self, identities: &[IdentityId]) -> SecurityResult<ActivityId> {
        self.submit(ActivityKind::DeleteIdentities {
            identities: identities.to_vec(),
        })
        .await
    }

    pub fn is_in_group(&self, member_id: IdentityId, group_id: IdentityId) -> SecurityResult<bool> {
        self.ensure_operational()?;
        Ok(self.inner.cache.read()?.is_in_group(member_id, group_id))
    }

    /// Flattened memberships of every user, `user:group,group;...`
    pub fn membership_dump(&self) -> SecurityResult<String> {
        Ok(self.inner.cache.read()?.membership_dump())
    }

    // ========== PERMISSION QUERIES ==========

    /// Run `query` against the cache, resolving `entity_id` first when it
    /// is not cached yet
    fn evaluate_with<T>(
        &self,
        entity_id: EntityId,
        query: impl FnOnce(&PermissionEvaluator<'_>) -> SecurityResult<T>,
    ) -> SecurityResult<T> {
        self.ensure_operational()?;
        if entity_id != 0 {
            self.inner.cache.ensure_entity(entity_id)?;
        }
        let state = self.inner.cache.read()?;
        query(&PermissionEvaluator::new(&state, self.inner.special))
    }

    pub fn evaluate(
        &self,
        user_id: IdentityId,
        entity_id: EntityId,
        permission: PermissionType,
        entry_types: EntryTypeSet,
    ) -> SecurityResult<PermissionValue> {
        self.evaluate_with(entity_id, |e| {
            e.evaluate(user_id, entity_id, permission, entry_types)
        })
    }

    pub fn get_permission(
        &self,
        user_id: IdentityId,
        entity_id: EntityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<PermissionValue> {
        self.evaluate_with(entity_id, |e| {
            e.get_permission(user_id, entity_id, permissions, EntryTypeSet::all())
        })
    }

    pub fn has_permission(
        &self,
        user_id: IdentityId,
        entity_id: EntityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<bool> {
        self.evaluate_with(entity_id, |e| {
            e.has_permission(user_id, entity_id, permissions)
        })
    }

    pub fn has_subtree_permission(
        &self,
        user_id: IdentityId,
        entity_id: EntityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<bool> {
        self.evaluate_with(entity_id, |e| {
            e.has_subtree_permission(user_id, entity_id, permissions)
        })
    }

    pub fn get_acl(&self, entity_id: EntityId) -> SecurityResult<AccessControlList> {
        self.evaluate_with(entity_id, |e| e.get_acl(entity_id))
    }

    pub fn get_explicit_entries(
        &self,
        entity_id: EntityId,
        entry_types: EntryTypeSet,
    ) -> SecurityResult<Vec<AceInfo>> {
        self.evaluate_with(entity_id, |e| {
            Ok(e.state().get_explicit_entries(entity_id, entry_types))
        })
    }

    pub fn get_effective_entries(
        &self,
        entity_id: EntityId,
        identity_id: Option<IdentityId>,
    ) -> SecurityResult<Vec<AceInfo>> {
        self.evaluate_with(entity_id, |e| e.get_effective_entries(entity_id, identity_id))
    }

    pub fn get_related_identities(
        &self,
        entity_id: EntityId,
        level: PermissionLevel,
        permissions: &[PermissionType],
    ) -> SecurityResult<BTreeSet<IdentityId>> {
        self.evaluate_with(entity_id, |e| {
            e.get_related_identities(entity_id, level, permissions)
        })
    }

    pub fn get_related_entities(
        &self,
        entity_id: EntityId,
        level: PermissionLevel,
        explicit_only: bool,
        identity_id: IdentityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<BTreeSet<EntityId>> {
        self.evaluate_with(entity_id, |e| {
            e.get_related_entities(entity_id, level, explicit_only, identity_id, permissions)
        })
    }

    pub fn get_related_entities_one_level(
        &self,
        entity_id: EntityId,
        level: PermissionLevel,
        identity_id: IdentityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<Vec<EntityId>> {
        self.evaluate_with(entity_id, |e| {
            e.get_related_entities_one_level(entity_id, level, identity_id, permissions)
        })
    }

    pub fn get_allowed_users(
        &self,
        entity_id: EntityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<Vec<IdentityId>> {
        self.evaluate_with(entity_id, |e| e.get_allowed_users(entity_id, permissions))
    }

    pub fn get_parent_groups(
        &self,
        identity_id: IdentityId,
        direct_only: bool,
    ) -> SecurityResult<Vec<IdentityId>> {
        self.evaluate_with(0, |e| Ok(e.get_parent_groups(identity_id, direct_only)))
    }

    pub fn get_related_permissions(
        &self,
        entity_id: EntityId,
        level: PermissionLevel,
        explicit_only: bool,
        identity_id: Option<IdentityId>,
    ) -> SecurityResult<BTreeMap<u8, usize>> {
        self.evaluate_with(entity_id, |e| {
            e.get_related_permissions(entity_id, level, explicit_only, identity_id)
        })
    }

    // ========== QUEUE INTROSPECTION ==========

    pub fn queue_snapshot(&self) -> SecurityResult<QueueSnapshot> {
        self.inner.queue.snapshot()
    }

    pub fn completion_state(&self) -> SecurityResult<CompletionState> {
        self.inner.queue.completion_state()
    }

    pub fn activity_history(&self) -> SecurityResult<Vec<HistoryEntry>> {
        self.inner.queue.history()
    }

    /// Wait until every queued activity has finished
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await
    }

    pub async fn health_check(&self) -> SecurityResult<HealthReport> {
        self.inner.queue.health_check().await
    }
}

async fn receive_loop(
    queue: ActivityQueue,
    data: Arc<dyn SecurityDataProvider>,
    messaging: Arc<dyn MessageProvider>,
    mut receiver: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = receiver.recv().await {
        if messaging.is_me(&envelope.sender) {
            continue;
        }
        let activity = match resolve_message(envelope.message, data.as_ref()).await {
            Ok(Some(activity)) => activity,
            Ok(None) => {
                warn!(
                    "⚠️ Activity referenced by {} is not in the store",
                    envelope.sender
                );
                continue;
            }
            Err(e) => {
                warn!("⚠️ Cannot read message from {}: {}", envelope.sender, e);
                continue;
            }
        };
        debug!(
            "📨 Received activity {} ({}) from {}",
            activity.id,
            activity.name(),
            envelope.sender
        );
        match queue.receive(activity).await {
            Ok(()) => {}
            Err(SecurityError::NotOperational) => break,
            Err(e) => warn!("⚠️ Rejected activity from {}: {}", envelope.sender, e),
        }
    }
    debug!("Receive loop of node {} stopped", messaging.node_id());
}
