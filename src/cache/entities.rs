//! Entity tree operations on the cache state.

use super::CacheState;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{require_id, EntityId, EntryType, EntryTypeSet, IdentityId, SecurityEntity};
use log::{debug, info, warn};
use std::collections::HashSet;

impl CacheState {
    pub fn get_entity(&self, entity_id: EntityId) -> Option<&SecurityEntity> {
        self.entities.get(&entity_id)
    }

    pub fn contains_entity(&self, entity_id: EntityId) -> bool {
        self.entities.contains_key(&entity_id)
    }

    /// Return the entity, resolving it through the missing-entity handler
    /// when it is not cached. Fails with `EntityNotFound` when unresolvable.
    pub fn require_entity(&mut self, entity_id: EntityId) -> SecurityResult<&SecurityEntity> {
        require_id(entity_id, "entity id")?;
        if !self.entity_or_resolve(entity_id) {
            return Err(SecurityError::EntityNotFound(entity_id));
        }
        self.entities
            .get(&entity_id)
            .ok_or(SecurityError::EntityNotFound(entity_id))
    }

    /// Whether the entity is cached, consulting the handler on a miss.
    pub(crate) fn entity_or_resolve(&mut self, entity_id: EntityId) -> bool {
        if self.entities.contains_key(&entity_id) {
            return true;
        }
        let mut visiting = HashSet::new();
        self.resolve_missing(entity_id, &mut visiting)
    }

    fn resolve_missing(&mut self, entity_id: EntityId, visiting: &mut HashSet<EntityId>) -> bool {
        if entity_id == 0 || !visiting.insert(entity_id) {
            return false;
        }
        let Some(handler) = self.missing_entity_handler.clone() else {
            return false;
        };
        let Some((parent_id, owner_id)) = handler.get_missing_entity(entity_id) else {
            debug!("Missing entity {} is unknown to the resolver", entity_id);
            return false;
        };
        if parent_id != 0
            && !self.entities.contains_key(&parent_id)
            && !self.resolve_missing(parent_id, visiting)
        {
            warn!(
                "⚠️ Cannot resolve entity {}: parent {} is unavailable",
                entity_id, parent_id
            );
            return false;
        }
        info!("📥 Lazily loaded entity {} (parent {})", entity_id, parent_id);
        self.create_entity(entity_id, parent_id, owner_id).is_ok()
    }

    /// Create an entity under `parent_id` (zero for a root).
    ///
    /// Creating an existing id is a successful no-op so replays are harmless.
    pub fn create_entity(
        &mut self,
        entity_id: EntityId,
        parent_id: EntityId,
        owner_id: IdentityId,
    ) -> SecurityResult<()> {
        require_id(entity_id, "entity id")?;
        if self.entities.contains_key(&entity_id) {
            return Ok(());
        }
        let (parent, level, holder) = if parent_id == 0 {
            (None, 0, None)
        } else {
            if !self.entity_or_resolve(parent_id) {
                return Err(SecurityError::EntityNotFound(parent_id));
            }
            let parent = self
                .entities
                .get_mut(&parent_id)
                .ok_or(SecurityError::EntityNotFound(parent_id))?;
            parent.children.push(entity_id);
            (Some(parent_id), parent.level + 1, parent.first_acl_holder)
        };
        let mut entity = SecurityEntity::new(entity_id, parent, owner_id, level);
        entity.first_acl_holder = holder;
        self.entities.insert(entity_id, entity);
        Ok(())
    }

    /// Remove the entity and its whole subtree, entries included.
    /// Returns the removed ids; a missing entity removes nothing.
    pub fn delete_entity(&mut self, entity_id: EntityId) -> Vec<EntityId> {
        let Some(entity) = self.entities.get(&entity_id) else {
            return Vec::new();
        };
        if let Some(parent_id) = entity.parent_id {
            if let Some(parent) = self.entities.get_mut(&parent_id) {
                parent.children.retain(|c| *c != entity_id);
            }
        }
        let mut removed = vec![entity_id];
        removed.extend(self.descendants(entity_id));
        for id in &removed {
            self.entities.remove(id);
            self.acls.remove(id);
        }
        removed
    }

    /// Relink `source_id` under `target_id`, recomputing the moved subtree.
    pub fn move_entity(&mut self, source_id: EntityId, target_id: EntityId) -> SecurityResult<()> {
        require_id(source_id, "source entity id")?;
        require_id(target_id, "target entity id")?;
        if !self.entity_or_resolve(source_id) {
            return Err(SecurityError::EntityNotFound(source_id));
        }
        if !self.entity_or_resolve(target_id) {
            return Err(SecurityError::EntityNotFound(target_id));
        }
        if source_id == target_id || self.is_descendant_of(target_id, source_id) {
            return Err(SecurityError::InvalidArgument(format!(
                "Cannot move entity {} under its own subtree ({})",
                source_id, target_id
            )));
        }
        let old_parent = self.entities.get(&source_id).and_then(|e| e.parent_id);
        if old_parent == Some(target_id) {
            return Ok(());
        }
        if let Some(old_parent) = old_parent.and_then(|p| self.entities.get_mut(&p)) {
            old_parent.children.retain(|c| *c != source_id);
        }
        if let Some(target) = self.entities.get_mut(&target_id) {
            target.children.push(source_id);
        }
        if let Some(source) = self.entities.get_mut(&source_id) {
            source.parent_id = Some(target_id);
        }
        self.refresh_subtree(source_id);
        Ok(())
    }

    pub fn modify_owner(&mut self, entity_id: EntityId, owner_id: IdentityId) -> SecurityResult<()> {
        require_id(entity_id, "entity id")?;
        if !self.entity_or_resolve(entity_id) {
            return Err(SecurityError::EntityNotFound(entity_id));
        }
        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.owner_id = owner_id;
        }
        Ok(())
    }

    /// Stop inheriting the given entry types on `entity_id` (all types when
    /// the set is empty). Repeating a break is a no-op.
    pub fn break_inheritance(&mut self, entity_id: EntityId, entry_types: EntryTypeSet) -> SecurityResult<()> {
        self.set_inheritance(entity_id, entry_types, true)
    }

    /// Resume inheriting the given entry types (all types when empty)
    pub fn unbreak_inheritance(&mut self, entity_id: EntityId, entry_types: EntryTypeSet) -> SecurityResult<()> {
        self.set_inheritance(entity_id, entry_types, false)
    }

    fn set_inheritance(
        &mut self,
        entity_id: EntityId,
        entry_types: EntryTypeSet,
        broken: bool,
    ) -> SecurityResult<()> {
        require_id(entity_id, "entity id")?;
        if !self.entity_or_resolve(entity_id) {
            return Err(SecurityError::EntityNotFound(entity_id));
        }
        let types = if entry_types.is_empty() {
            EntryTypeSet::all()
        } else {
            entry_types
        };
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(SecurityError::EntityNotFound(entity_id))?;
        let before = entity.inheritance_breaks;
        for entry_type in types.iter() {
            if broken {
                entity.inheritance_breaks.insert(entry_type);
            } else {
                entity.inheritance_breaks.remove(entry_type);
            }
        }
        if before != entity.inheritance_breaks {
            self.refresh_subtree(entity_id);
        }
        Ok(())
    }

    /// Ancestors of `entity_id` from the parent up to the root
    pub fn ancestors(&self, entity_id: EntityId) -> Vec<EntityId> {
        let mut result = Vec::new();
        let mut current = self.entities.get(&entity_id).and_then(|e| e.parent_id);
        while let Some(id) = current {
            if result.contains(&id) {
                break;
            }
            result.push(id);
            current = self.entities.get(&id).and_then(|e| e.parent_id);
        }
        result
    }

    /// All descendants of `entity_id` (the entity itself excluded)
    pub fn descendants(&self, entity_id: EntityId) -> Vec<EntityId> {
        let mut result = Vec::new();
        let mut stack: Vec<EntityId> = self
            .entities
            .get(&entity_id)
            .map(|e| e.children.clone())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            result.push(id);
            if let Some(entity) = self.entities.get(&id) {
                stack.extend(entity.children.iter().copied());
            }
        }
        result
    }

    /// Whether `entity_id` lies strictly below `ancestor_id`
    pub fn is_descendant_of(&self, entity_id: EntityId, ancestor_id: EntityId) -> bool {
        self.ancestors(entity_id).contains(&ancestor_id)
    }

    /// Nearest entity, starting at `entity_id` itself, that holds an ACL
    pub fn get_first_acl_holder(&self, entity_id: EntityId) -> Option<EntityId> {
        self.entities.get(&entity_id).and_then(|e| e.first_acl_holder)
    }

    /// An entity holds an ACL when it has explicit entries or breaks inheritance
    pub(crate) fn is_acl_holder(&self, entity_id: EntityId) -> bool {
        let has_entries = self.acls.get(&entity_id).is_some_and(|m| !m.is_empty());
        has_entries
            || self
                .entities
                .get(&entity_id)
                .is_some_and(|e| !e.is_inherited())
    }

    /// Recompute level and nearest-ACL-holder for `root_id` and its subtree
    pub(crate) fn refresh_subtree(&mut self, root_id: EntityId) {
        let (level, holder) = match self
            .entities
            .get(&root_id)
            .and_then(|e| e.parent_id)
            .and_then(|p| self.entities.get(&p))
        {
            Some(parent) => (parent.level + 1, parent.first_acl_holder),
            None => (0, None),
        };
        let mut stack = vec![(root_id, level, holder)];
        while let Some((id, level, inherited_holder)) = stack.pop() {
            let holder = if self.is_acl_holder(id) {
                Some(id)
            } else {
                inherited_holder
            };
            let Some(entity) = self.entities.get_mut(&id) else {
                continue;
            };
            entity.level = level;
            entity.first_acl_holder = holder;
            for child in &entity.children {
                stack.push((*child, level + 1, holder));
            }
        }
    }

    /// The ACL holder the given holder inherits `entry_type` entries from
    pub(crate) fn parent_acl_holder(&self, holder_id: EntityId) -> Option<EntityId> {
        self.entities
            .get(&holder_id)
            .and_then(|e| e.parent_id)
            .and_then(|p| self.get_first_acl_holder(p))
    }

    /// Whether `entity_id` inherits `entry_type`
    pub(crate) fn inherits(&self, entity_id: EntityId, entry_type: EntryType) -> bool {
        self.entities
            .get(&entity_id)
            .map_or(false, |e| e.inherits(entry_type))
    }
}
