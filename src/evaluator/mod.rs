//! # Permission Evaluator
//!
//! Read-only decisions over a [`CacheState`] snapshot. The caller holds the
//! cache read lock for the lifetime of the evaluator, so every decision sees
//! one consistent tree.
//!
//! A decision walks the ACL chain nearest holder first. Each entry type is
//! walked until a holder that does not inherit it; a bit is decided by the
//! first holder that mentions it, deny winning over allow within a holder.

pub mod query;

use crate::cache::CacheState;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{
    require_id, AccessControlEntry, AccessControlList, AceInfo, EntityId, EntryType,
    EntryTypeSet, IdentityId, PermissionBits, PermissionType, PermissionValue,
};
use std::collections::{BTreeMap, BTreeSet};

/// Well-known groups that join identity sets implicitly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialGroups {
    /// Joins the identity set of a user on entities the user owns
    pub owner_group_id: Option<IdentityId>,
    /// Joins every identity set
    pub everyone_group_id: Option<IdentityId>,
}

/// Per-bit outcome of a walk: bits allowed and bits denied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitDecision {
    pub allow: PermissionBits,
    pub deny: PermissionBits,
}

impl BitDecision {
    fn decided(&self) -> PermissionBits {
        self.allow | self.deny
    }

    /// Merge one holder's bits into the still undecided part
    fn merge_level(&mut self, allow: PermissionBits, deny: PermissionBits) {
        let open = !self.decided();
        self.deny |= deny & open;
        self.allow |= allow & !deny & open;
    }

    pub fn value_of(&self, index: u8) -> PermissionValue {
        let bit = PermissionBits::from_index(index);
        if self.deny.contains(bit) {
            PermissionValue::Denied
        } else if self.allow.contains(bit) {
            PermissionValue::Allowed
        } else {
            PermissionValue::Undefined
        }
    }
}

/// Evaluates permissions against a borrowed cache state
pub struct PermissionEvaluator<'a> {
    state: &'a CacheState,
    special: SpecialGroups,
}

impl<'a> PermissionEvaluator<'a> {
    #[must_use]
    pub fn new(state: &'a CacheState, special: SpecialGroups) -> Self {
        Self { state, special }
    }

    pub fn state(&self) -> &'a CacheState {
        self.state
    }

    fn require_cached(&self, entity_id: EntityId) -> SecurityResult<()> {
        require_id(entity_id, "entity id")?;
        if !self.state.contains_entity(entity_id) {
            return Err(SecurityError::EntityNotFound(entity_id));
        }
        Ok(())
    }

    /// The identities whose entries apply to `user_id` on `entity_id`:
    /// the user, its groups, the everyone group, and the owner group when
    /// the user owns the entity.
    pub fn identities_for(&self, user_id: IdentityId, entity_id: EntityId) -> BTreeSet<IdentityId> {
        let mut identities = self.state.identities_of(user_id);
        if let Some(everyone) = self.special.everyone_group_id {
            identities.insert(everyone);
        }
        if let Some(owners) = self.special.owner_group_id {
            let owns = self
                .state
                .get_entity(entity_id)
                .is_some_and(|e| e.owner_id == user_id);
            if owns {
                identities.insert(owners);
            }
        }
        identities
    }

    /// Visit the contributing ACL holders of `entity_id`, nearest first,
    /// together with the entry types still inherited at that holder.
    /// The visitor returns `false` to stop the walk.
    fn walk<F>(&self, entity_id: EntityId, entry_types: EntryTypeSet, mut visit: F)
    where
        F: FnMut(EntityId, EntryTypeSet) -> bool,
    {
        let mut active = entry_types;
        for holder in self.state.acl_chain(entity_id) {
            if active.is_empty() || !visit(holder, active) {
                return;
            }
            for entry_type in active.iter() {
                if !self.state.inherits(holder, entry_type) {
                    active.remove(entry_type);
                }
            }
        }
    }

    /// Entries of `holder` that take part in evaluating `entity_id`.
    /// Local-only entries apply on their own entity only.
    fn applicable_entries(
        &self,
        holder: EntityId,
        entity_id: EntityId,
        active: EntryTypeSet,
    ) -> impl Iterator<Item = &'a AceInfo> + 'a {
        let own = holder == entity_id;
        self.state
            .acls
            .get(&holder)
            .into_iter()
            .flat_map(|entries| entries.values())
            .filter(move |ace| active.contains(ace.entry_type) && (own || !ace.local_only))
    }

    /// Decide the bits of `needed` for a fixed identity set
    pub fn decide(
        &self,
        identities: &BTreeSet<IdentityId>,
        entity_id: EntityId,
        needed: PermissionBits,
        entry_types: EntryTypeSet,
    ) -> BitDecision {
        let mut decision = BitDecision::default();
        self.walk(entity_id, entry_types, |holder, active| {
            let (mut allow, mut deny) = (PermissionBits::EMPTY, PermissionBits::EMPTY);
            for ace in self
                .applicable_entries(holder, entity_id, active)
                .filter(|ace| identities.contains(&ace.identity_id))
            {
                allow |= ace.allow_bits;
                deny |= ace.deny_bits;
            }
            decision.merge_level(allow, deny);
            !decision.decided().contains(needed)
        });
        decision
    }

    /// Value of a single permission for a user
    pub fn evaluate(
        &self,
        user_id: IdentityId,
        entity_id: EntityId,
        permission: PermissionType,
        entry_types: EntryTypeSet,
    ) -> SecurityResult<PermissionValue> {
        require_id(user_id, "user id")?;
        self.require_cached(entity_id)?;
        let identities = self.identities_for(user_id, entity_id);
        let decision = self.decide(&identities, entity_id, permission.mask(), entry_types);
        Ok(decision.value_of(permission.index))
    }

    /// Aggregate value of several permissions: `Denied` if any is denied,
    /// `Allowed` if all are allowed, `Undefined` otherwise.
    pub fn get_permission(
        &self,
        user_id: IdentityId,
        entity_id: EntityId,
        permissions: &[PermissionType],
        entry_types: EntryTypeSet,
    ) -> SecurityResult<PermissionValue> {
        require_id(user_id, "user id")?;
        self.require_cached(entity_id)?;
        if permissions.is_empty() {
            return Err(SecurityError::invalid_argument(
                "at least one permission is required",
            ));
        }
        let needed = permissions
            .iter()
            .fold(PermissionBits::EMPTY, |acc, p| acc | p.mask());
        let identities = self.identities_for(user_id, entity_id);
        let decision = self.decide(&identities, entity_id, needed, entry_types);
        if decision.deny.intersects(needed) {
            Ok(PermissionValue::Denied)
        } else if decision.allow.contains(needed) {
            Ok(PermissionValue::Allowed)
        } else {
            Ok(PermissionValue::Undefined)
        }
    }

    /// Whether every permission is allowed through any entry type
    pub fn has_permission(
        &self,
        user_id: IdentityId,
        entity_id: EntityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<bool> {
        Ok(self.get_permission(user_id, entity_id, permissions, EntryTypeSet::all())?
            == PermissionValue::Allowed)
    }

    /// Whether every permission is allowed on the entity and on each of its
    /// descendants
    pub fn has_subtree_permission(
        &self,
        user_id: IdentityId,
        entity_id: EntityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<bool> {
        if !self.has_permission(user_id, entity_id, permissions)? {
            return Ok(false);
        }
        for descendant in self.state.descendants(entity_id) {
            if !self.has_permission(user_id, descendant, permissions)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Per-identity decisions of one entry type, walked on its own chain
    fn decide_per_identity(
        &self,
        entity_id: EntityId,
        entry_type: EntryType,
    ) -> BTreeMap<IdentityId, BitDecision> {
        let mut decisions: BTreeMap<IdentityId, BitDecision> = BTreeMap::new();
        self.walk(entity_id, EntryTypeSet::of(&[entry_type]), |holder, active| {
            let mut level: BTreeMap<IdentityId, (PermissionBits, PermissionBits)> = BTreeMap::new();
            for ace in self.applicable_entries(holder, entity_id, active) {
                let bits = level
                    .entry(ace.identity_id)
                    .or_insert((PermissionBits::EMPTY, PermissionBits::EMPTY));
                bits.0 |= ace.allow_bits;
                bits.1 |= ace.deny_bits;
            }
            for (identity, (allow, deny)) in level {
                decisions.entry(identity).or_default().merge_level(allow, deny);
            }
            true
        });
        decisions
    }

    /// One Normal entry per identity: the Normal and the Sharing chains are
    /// walked independently and their decisions OR-ed together.
    pub fn get_effective_entries(
        &self,
        entity_id: EntityId,
        identity_id: Option<IdentityId>,
    ) -> SecurityResult<Vec<AceInfo>> {
        self.require_cached(entity_id)?;
        let normal = self.decide_per_identity(entity_id, EntryType::Normal);
        let sharing = self.decide_per_identity(entity_id, EntryType::Sharing);

        let identities: BTreeSet<IdentityId> = normal.keys().chain(sharing.keys()).copied().collect();
        let entries = identities
            .into_iter()
            .filter(|id| identity_id.map_or(true, |wanted| wanted == *id))
            .map(|id| {
                let n = normal.get(&id).copied().unwrap_or_default();
                let s = sharing.get(&id).copied().unwrap_or_default();
                AceInfo::new(EntryType::Normal, id, false).with_bits(n.allow | s.allow, n.deny | s.deny)
            })
            .filter(|ace| !ace.is_empty())
            .collect();
        Ok(entries)
    }

    /// Merged display view of an entity: per (entry type, identity,
    /// local-only) key every defined bit with the entity it comes from.
    pub fn get_acl(&self, entity_id: EntityId) -> SecurityResult<AccessControlList> {
        self.require_cached(entity_id)?;
        let mut merged: BTreeMap<(EntryType, IdentityId, bool), AccessControlEntry> = BTreeMap::new();
        self.walk(entity_id, EntryTypeSet::all(), |holder, active| {
            for ace in self.applicable_entries(holder, entity_id, active) {
                let entry = merged
                    .entry((ace.entry_type, ace.identity_id, ace.local_only))
                    .or_insert_with(|| AccessControlEntry {
                        identity_id: ace.identity_id,
                        entry_type: ace.entry_type,
                        local_only: ace.local_only,
                        allow_bits: PermissionBits::EMPTY,
                        deny_bits: PermissionBits::EMPTY,
                        sources: Vec::new(),
                    });
                let open = !(entry.allow_bits | entry.deny_bits);
                let deny = ace.deny_bits & open;
                let allow = ace.allow_bits & !ace.deny_bits & open;
                entry.deny_bits |= deny;
                entry.allow_bits |= allow;
                entry
                    .sources
                    .extend(deny.indices().map(|i| (i, PermissionValue::Denied, holder)));
                entry
                    .sources
                    .extend(allow.indices().map(|i| (i, PermissionValue::Allowed, holder)));
            }
            true
        });

        let inherits = self
            .state
            .get_entity(entity_id)
            .map(|e| {
                let mut set = EntryTypeSet::empty();
                for entry_type in EntryType::ALL {
                    if e.inherits(entry_type) {
                        set.insert(entry_type);
                    }
                }
                set
            })
            .unwrap_or_else(EntryTypeSet::all);
        let entries = merged
            .into_values()
            .map(|mut entry| {
                entry.sources.sort_unstable_by_key(|(index, _, _)| *index);
                entry
            })
            .collect();
        Ok(AccessControlList {
            entity_id,
            inherits,
            entries,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::cache::test_support::state_with;
    use crate::cache::CacheState;
    use crate::model::{AceInfo, EntryType, PermissionBits};

    pub fn allow(entry_type: EntryType, identity: i32, bit: u8) -> AceInfo {
        AceInfo::new(entry_type, identity, false)
            .with_bits(PermissionBits::from_index(bit), PermissionBits::EMPTY)
    }

    pub fn deny(entry_type: EntryType, identity: i32, bit: u8) -> AceInfo {
        AceInfo::new(entry_type, identity, false)
            .with_bits(PermissionBits::EMPTY, PermissionBits::from_index(bit))
    }

    /// E1 -> E2 -> E5 -> E14, owner 1 everywhere
    pub fn chain() -> CacheState {
        state_with(&[(1, 0, 1), (2, 1, 1), (5, 2, 1), (14, 5, 1)])
    }
}
