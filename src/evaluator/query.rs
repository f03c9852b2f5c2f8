//! Related-identity and related-entity queries.
//!
//! These are read-only traversals over the same chain walk and membership
//! closure the evaluator uses. `explicit_only` restricts a query to entries
//! stored in the subtree; otherwise the entries inherited onto the subtree
//! root count as well.

use super::PermissionEvaluator;
use crate::error::SecurityResult;
use crate::model::{
    AceInfo, EntityId, EntryTypeSet, IdentityId, PermissionBits, PermissionLevel, PermissionType,
};
use std::collections::{BTreeMap, BTreeSet};

impl<'a> PermissionEvaluator<'a> {
    /// Entries relevant for a subtree query rooted at `entity_id`
    fn subtree_entries(&self, entity_id: EntityId, explicit_only: bool) -> SecurityResult<Vec<(EntityId, AceInfo)>> {
        self.require_cached(entity_id)?;
        let mut result: Vec<(EntityId, AceInfo)> = if explicit_only {
            self.state
                .get_explicit_entries(entity_id, EntryTypeSet::all())
                .into_iter()
                .map(|ace| (entity_id, ace))
                .collect()
        } else {
            self.get_effective_entries(entity_id, None)?
                .into_iter()
                .map(|ace| (entity_id, ace))
                .collect()
        };
        for descendant in self.state.descendants(entity_id) {
            result.extend(
                self.state
                    .get_explicit_entries(descendant, EntryTypeSet::all())
                    .into_iter()
                    .map(|ace| (descendant, ace)),
            );
        }
        Ok(result)
    }

    /// Identities with an entry matching `level` on any of `permissions`
    /// in the subtree of `entity_id`
    pub fn get_related_identities(
        &self,
        entity_id: EntityId,
        level: PermissionLevel,
        permissions: &[PermissionType],
    ) -> SecurityResult<BTreeSet<IdentityId>> {
        let mask = mask_of(permissions);
        Ok(self
            .subtree_entries(entity_id, false)?
            .into_iter()
            .filter(|(_, ace)| level.matches(ace.allow_bits, ace.deny_bits, mask))
            .map(|(_, ace)| ace.identity_id)
            .collect())
    }

    /// Entities of the subtree where `identity_id` (or, unless
    /// `explicit_only`, one of its groups) has a matching entry
    pub fn get_related_entities(
        &self,
        entity_id: EntityId,
        level: PermissionLevel,
        explicit_only: bool,
        identity_id: IdentityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<BTreeSet<EntityId>> {
        let mask = mask_of(permissions);
        let identities = if explicit_only {
            BTreeSet::from([identity_id])
        } else {
            self.state.identities_of(identity_id)
        };
        Ok(self
            .subtree_entries(entity_id, explicit_only)?
            .into_iter()
            .filter(|(_, ace)| identities.contains(&ace.identity_id))
            .filter(|(_, ace)| level.matches(ace.allow_bits, ace.deny_bits, mask))
            .map(|(id, _)| id)
            .collect())
    }

    /// Direct children of `entity_id` whose effective entries for
    /// `identity_id` or its groups match
    pub fn get_related_entities_one_level(
        &self,
        entity_id: EntityId,
        level: PermissionLevel,
        identity_id: IdentityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<Vec<EntityId>> {
        self.require_cached(entity_id)?;
        let mask = mask_of(permissions);
        let identities = self.state.identities_of(identity_id);
        let children = self
            .state
            .get_entity(entity_id)
            .map(|e| e.children.clone())
            .unwrap_or_default();
        let mut result = Vec::new();
        for child in children {
            let matched = self
                .get_effective_entries(child, None)?
                .iter()
                .filter(|ace| identities.contains(&ace.identity_id))
                .any(|ace| level.matches(ace.allow_bits, ace.deny_bits, mask));
            if matched {
                result.push(child);
            }
        }
        result.sort_unstable();
        Ok(result)
    }

    /// Users that have every permission on `entity_id`. Candidates are the
    /// users named in effective entries, users of named groups and the
    /// entity owner.
    pub fn get_allowed_users(
        &self,
        entity_id: EntityId,
        permissions: &[PermissionType],
    ) -> SecurityResult<Vec<IdentityId>> {
        let mut candidates = BTreeSet::new();
        for ace in self.get_effective_entries(entity_id, None)? {
            if self.state.is_group(ace.identity_id) {
                candidates.extend(self.state.users_in_group(ace.identity_id));
            } else {
                candidates.insert(ace.identity_id);
            }
        }
        if let Some(entity) = self.state.get_entity(entity_id) {
            if entity.owner_id != 0 {
                candidates.insert(entity.owner_id);
            }
        }
        let mut allowed = Vec::new();
        for user in candidates {
            if self.special.owner_group_id == Some(user) || self.special.everyone_group_id == Some(user) {
                continue;
            }
            if self.has_permission(user, entity_id, permissions)? {
                allowed.push(user);
            }
        }
        Ok(allowed)
    }

    pub fn get_parent_groups(&self, identity_id: IdentityId, direct_only: bool) -> Vec<IdentityId> {
        self.state.get_parent_groups(identity_id, direct_only)
    }

    /// Number of matching entries per permission index in the subtree,
    /// optionally restricted to one identity. Zero counts are omitted.
    pub fn get_related_permissions(
        &self,
        entity_id: EntityId,
        level: PermissionLevel,
        explicit_only: bool,
        identity_id: Option<IdentityId>,
    ) -> SecurityResult<BTreeMap<u8, usize>> {
        let mut counts = BTreeMap::new();
        for (_, ace) in self.subtree_entries(entity_id, explicit_only)? {
            if identity_id.is_some_and(|wanted| wanted != ace.identity_id) {
                continue;
            }
            let bits = match level {
                PermissionLevel::Allowed => ace.allow_bits,
                PermissionLevel::Denied => ace.deny_bits,
                PermissionLevel::AllowedOrDenied => ace.allow_bits | ace.deny_bits,
            };
            for index in bits.indices() {
                *counts.entry(index).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

fn mask_of(permissions: &[PermissionType]) -> PermissionBits {
    if permissions.is_empty() {
        return PermissionBits::ALL;
    }
    permissions
        .iter()
        .fold(PermissionBits::EMPTY, |acc, p| acc | p.mask())
}
