//! # ACL Editor
//!
//! Collects permission edits and inheritance breaks, then submits them as a
//! single `SetAcl` activity. Edits start from the entries currently stored
//! in the cache, so `allow` adds bits to an existing entry instead of
//! replacing it.
//!
//! Allowing a permission also allows everything it depends on; denying a
//! permission also denies everything that depends on it.

use crate::activities::{ActivityKind, SecurityActivity};
use crate::cache::SecurityCache;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{
    require_id, AceInfo, AceKey, AclInfo, ActivityId, EntityId, EntryType, EntryTypeSet,
    IdentityId, PermissionBits, PermissionType,
};
use crate::queue::ActivityQueue;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct EditedEntry {
    original: AceInfo,
    current: AceInfo,
}

fn mask_of(permissions: &[PermissionType]) -> PermissionBits {
    permissions
        .iter()
        .fold(PermissionBits::EMPTY, |mask, p| mask | p.mask())
}

fn expand(entry_types: EntryTypeSet) -> EntryTypeSet {
    if entry_types.is_empty() {
        EntryTypeSet::all()
    } else {
        entry_types
    }
}

/// Pending ACL changes of one entry type
pub struct AclEditor {
    cache: Arc<SecurityCache>,
    queue: ActivityQueue,
    entry_type: EntryType,
    entries: BTreeMap<(EntityId, AceKey), EditedEntry>,
    breaks: BTreeMap<EntityId, EntryTypeSet>,
    undo_breaks: BTreeMap<EntityId, EntryTypeSet>,
}

impl AclEditor {
    pub(crate) fn new(cache: Arc<SecurityCache>, queue: ActivityQueue, entry_type: EntryType) -> Self {
        Self {
            cache,
            queue,
            entry_type,
            entries: BTreeMap::new(),
            breaks: BTreeMap::new(),
            undo_breaks: BTreeMap::new(),
        }
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    fn require_entity(&self, entity_id: EntityId) -> SecurityResult<()> {
        require_id(entity_id, "entity id")?;
        if !self.cache.ensure_entity(entity_id)? {
            return Err(SecurityError::EntityNotFound(entity_id));
        }
        Ok(())
    }

    /// The edited entry of a key, seeded from the cache on first use
    fn entry_mut(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
    ) -> SecurityResult<&mut AceInfo> {
        self.require_entity(entity_id)?;
        require_id(identity_id, "identity id")?;
        let blank = AceInfo::new(self.entry_type, identity_id, local_only);
        let key = blank.key();
        if !self.entries.contains_key(&(entity_id, key)) {
            let original = self
                .cache
                .read()?
                .get_explicit_entry(entity_id, &key)
                .unwrap_or(blank);
            self.entries.insert(
                (entity_id, key),
                EditedEntry {
                    original,
                    current: original,
                },
            );
        }
        self.entries
            .get_mut(&(entity_id, key))
            .map(|edited| &mut edited.current)
            .ok_or_else(|| SecurityError::Internal(format!("edited entry of {} vanished", entity_id)))
    }

    /// Allow the permissions and everything they depend on
    pub fn allow(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        permissions: &[PermissionType],
    ) -> SecurityResult<&mut Self> {
        let mask = PermissionType::with_allow_dependencies(mask_of(permissions));
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.allow_bits |= mask;
        entry.deny_bits &= !mask;
        Ok(self)
    }

    /// Deny the permissions and everything that depends on them
    pub fn deny(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        permissions: &[PermissionType],
    ) -> SecurityResult<&mut Self> {
        let mask = PermissionType::with_deny_dependents(mask_of(permissions));
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.deny_bits |= mask;
        entry.allow_bits &= !mask;
        Ok(self)
    }

    /// Neither allow nor deny the permissions
    pub fn clear_permission(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        permissions: &[PermissionType],
    ) -> SecurityResult<&mut Self> {
        let mask = mask_of(permissions);
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.allow_bits &= !mask;
        entry.deny_bits &= !mask;
        Ok(self)
    }

    /// Overwrite both masks of an entry. Dependencies are not expanded.
    pub fn set(
        &mut self,
        entity_id: EntityId,
        identity_id: IdentityId,
        local_only: bool,
        allow_bits: PermissionBits,
        deny_bits: PermissionBits,
    ) -> SecurityResult<&mut Self> {
        let entry = self.entry_mut(entity_id, identity_id, local_only)?;
        entry.deny_bits = deny_bits;
        entry.allow_bits = allow_bits & !deny_bits;
        Ok(self)
    }

    /// Stop inheriting the given entry types (all when empty)
    pub fn break_inheritance(
        &mut self,
        entity_id: EntityId,
        entry_types: EntryTypeSet,
    ) -> SecurityResult<&mut Self> {
        self.require_entity(entity_id)?;
        let types = expand(entry_types);
        for entry_type in types.iter() {
            if let Some(undo) = self.undo_breaks.get_mut(&entity_id) {
                undo.remove(entry_type);
            }
            self.breaks.entry(entity_id).or_default().insert(entry_type);
        }
        Ok(self)
    }

    /// Resume inheriting the given entry types (all when empty)
    pub fn unbreak_inheritance(
        &mut self,
        entity_id: EntityId,
        entry_types: EntryTypeSet,
    ) -> SecurityResult<&mut Self> {
        self.require_entity(entity_id)?;
        let types = expand(entry_types);
        for entry_type in types.iter() {
            if let Some(broken) = self.breaks.get_mut(&entity_id) {
                broken.remove(entry_type);
            }
            self.undo_breaks.entry(entity_id).or_default().insert(entry_type);
        }
        Ok(self)
    }

    /// The `SetAcl` payload of the edits that change something
    fn build_kind(&self) -> SecurityResult<Option<ActivityKind>> {
        let mut acls: BTreeMap<EntityId, Vec<AceInfo>> = BTreeMap::new();
        for ((entity_id, _), edited) in &self.entries {
            if edited.current != edited.original {
                acls.entry(*entity_id).or_default().push(edited.current);
            }
        }

        let state = self.cache.read()?;
        let changed = |entity_id: EntityId, types: EntryTypeSet, broken: bool| {
            let mut effective = EntryTypeSet::empty();
            if let Some(entity) = state.get_entity(entity_id) {
                for entry_type in types.iter() {
                    if entity.inherits(entry_type) == broken {
                        effective.insert(entry_type);
                    }
                }
            }
            effective
        };
        let breaks: Vec<(EntityId, EntryTypeSet)> = self
            .breaks
            .iter()
            .map(|(id, types)| (*id, changed(*id, *types, true)))
            .filter(|(_, types)| !types.is_empty())
            .collect();
        let undo_breaks: Vec<(EntityId, EntryTypeSet)> = self
            .undo_breaks
            .iter()
            .map(|(id, types)| (*id, changed(*id, *types, false)))
            .filter(|(_, types)| !types.is_empty())
            .collect();

        if acls.is_empty() && breaks.is_empty() && undo_breaks.is_empty() {
            return Ok(None);
        }
        Ok(Some(ActivityKind::SetAcl {
            acls: acls
                .into_iter()
                .map(|(entity_id, entries)| AclInfo::new(entity_id).with_entries(entries))
                .collect(),
            breaks,
            undo_breaks,
        }))
    }

    /// Submit the edits as one activity and wait for it to execute.
    /// Returns `None` when nothing would change.
    pub async fn apply(self) -> SecurityResult<Option<ActivityId>> {
        let Some(kind) = self.build_kind()? else {
            debug!("ACL editor has no effective changes, nothing to apply");
            return Ok(None);
        };
        let activity = SecurityActivity::new(kind);
        activity.validate()?;
        let id = self.queue.execute_local(activity).await?;
        info!("🔐 Applied ACL changes as activity {}", id);
        Ok(Some(id))
    }
}
