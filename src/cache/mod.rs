//! # Security Cache
//!
//! Authoritative in-memory copy of the entity tree, the explicit ACL entries
//! and the group memberships. All state lives in one [`CacheState`] behind a
//! `RwLock`: permission evaluation takes the read lock and runs fully in
//! parallel, while an activity's Apply phase takes the write lock once, so a
//! reader never observes a half-moved subtree or a half-replaced ACL.
//!
//! Submodules extend `CacheState`:
//!
//! - [`entities`] - tree structure, levels and nearest-ACL-holder pointers
//! - [`acls`] - explicit entries, breaks and ACL chain views
//! - [`membership`] - groups, direct memberships and the flattened closure

pub mod acls;
pub mod entities;
pub mod membership;

use crate::error::{SecurityError, SecurityResult};
use crate::model::{
    AceInfo, AceKey, EntityId, IdentityId, Membership, SecurityEntity, SecurityGroup, StoredAce,
    StoredSecurityEntity,
};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Collaborator consulted when a requested entity is not in the cache.
///
/// Returns `(parent_id, owner_id)` of the entity when the authoritative
/// source knows it. A parent id of zero means a root entity.
pub trait MissingEntityHandler: Send + Sync {
    fn get_missing_entity(&self, entity_id: EntityId) -> Option<(EntityId, IdentityId)>;
}

/// The complete cached state. Mutated only under the cache write lock.
#[derive(Default)]
pub struct CacheState {
    pub(crate) entities: HashMap<EntityId, SecurityEntity>,
    /// Explicit entries per entity, keyed for replace-by-key semantics
    pub(crate) acls: HashMap<EntityId, BTreeMap<AceKey, AceInfo>>,
    pub(crate) groups: HashMap<IdentityId, SecurityGroup>,
    /// Direct parent groups of every user that belongs to a group
    pub(crate) user_groups: HashMap<IdentityId, BTreeSet<IdentityId>>,
    /// Transitive parent groups of every user
    pub(crate) flattened: HashMap<IdentityId, BTreeSet<IdentityId>>,
    pub(crate) missing_entity_handler: Option<Arc<dyn MissingEntityHandler>>,
}

impl CacheState {
    /// Build a state from persisted rows.
    ///
    /// Rows may arrive in any order; entities whose parent is not present are
    /// skipped with a warning since they cannot be placed in the tree.
    pub fn build(
        entities: Vec<StoredSecurityEntity>,
        aces: Vec<StoredAce>,
        memberships: Vec<Membership>,
    ) -> Self {
        let mut state = CacheState::default();
        let rows: HashMap<EntityId, StoredSecurityEntity> =
            entities.into_iter().map(|e| (e.id, e)).collect();

        let mut children: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
        for row in rows.values() {
            children.entry(row.parent_id).or_default().push(row.id);
        }
        for list in children.values_mut() {
            list.sort_unstable();
        }

        // Walk down from the roots so parents are always placed first.
        let mut frontier: Vec<EntityId> = children.get(&0).cloned().unwrap_or_default();
        while let Some(id) = frontier.pop() {
            let Some(row) = rows.get(&id) else { continue };
            let (parent_id, level) = if row.parent_id == 0 {
                (None, 0)
            } else {
                match state.entities.get(&row.parent_id) {
                    Some(parent) => (Some(parent.id), parent.level + 1),
                    None => continue,
                }
            };
            let mut entity = SecurityEntity::new(id, parent_id, row.owner_id, level);
            entity.inheritance_breaks = row.inheritance_breaks;
            state.entities.insert(id, entity);
            if let Some(parent_id) = parent_id {
                if let Some(parent) = state.entities.get_mut(&parent_id) {
                    parent.children.push(id);
                }
            }
            if let Some(kids) = children.get(&id) {
                frontier.extend(kids.iter().copied());
            }
        }
        let skipped = rows.len() - state.entities.len();
        if skipped > 0 {
            warn!("⚠️ Skipped {} entities whose ancestors are missing", skipped);
        }

        for ace in aces {
            if !state.entities.contains_key(&ace.entity_id) {
                warn!("⚠️ Skipping entry of unknown entity {}", ace.entity_id);
                continue;
            }
            state
                .acls
                .entry(ace.entity_id)
                .or_default()
                .insert(ace.key(), ace.ace());
        }

        for membership in memberships {
            state.insert_membership(membership);
        }
        state.recompute_flattened();

        let roots: Vec<EntityId> = state
            .entities
            .values()
            .filter(|e| e.parent_id.is_none())
            .map(|e| e.id)
            .collect();
        for root in roots {
            state.refresh_subtree(root);
        }

        info!(
            "✅ Security cache built: {} entities, {} ACLs, {} groups",
            state.entities.len(),
            state.acls.len(),
            state.groups.len()
        );
        state
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

/// Thread-safe wrapper around [`CacheState`]
pub struct SecurityCache {
    state: RwLock<CacheState>,
}

impl SecurityCache {
    pub fn new(state: CacheState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn empty() -> Self {
        Self::new(CacheState::default())
    }

    /// Install the collaborator used to resolve cache misses
    pub fn set_missing_entity_handler(
        &self,
        handler: Arc<dyn MissingEntityHandler>,
    ) -> SecurityResult<()> {
        self.write()?.missing_entity_handler = Some(handler);
        Ok(())
    }

    pub fn read(&self) -> SecurityResult<RwLockReadGuard<'_, CacheState>> {
        self.state
            .read()
            .map_err(|_| SecurityError::LockPoisoned("security cache".to_string()))
    }

    pub fn write(&self) -> SecurityResult<RwLockWriteGuard<'_, CacheState>> {
        self.state
            .write()
            .map_err(|_| SecurityError::LockPoisoned("security cache".to_string()))
    }

    /// Replace the whole state, used when reloading from the store
    pub fn replace(&self, state: CacheState) -> SecurityResult<()> {
        let mut guard = self.write()?;
        let handler = guard.missing_entity_handler.take();
        *guard = state;
        guard.missing_entity_handler = handler;
        Ok(())
    }

    /// Make sure `entity_id` is cached, asking the missing-entity handler on
    /// a miss. Returns whether the entity is available afterwards.
    pub fn ensure_entity(&self, entity_id: EntityId) -> SecurityResult<bool> {
        if self.read()?.entities.contains_key(&entity_id) {
            return Ok(true);
        }
        let mut state = self.write()?;
        Ok(state.entity_or_resolve(entity_id))
    }
}
