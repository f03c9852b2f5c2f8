//! Explicit ACL storage on the cache state.

use super::CacheState;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{require_id, AceInfo, AceKey, AclInfo, EntityId, EntryType, EntryTypeSet, IdentityId};
use std::collections::HashSet;

impl CacheState {
    /// Exactly the stored entries of an entity, filtered by entry type.
    /// Normal and Sharing entries are kept separate.
    pub fn get_explicit_entries(&self, entity_id: EntityId, entry_types: EntryTypeSet) -> Vec<AceInfo> {
        self.acls
            .get(&entity_id)
            .map(|entries| {
                entries
                    .values()
                    .filter(|ace| entry_types.contains(ace.entry_type))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The stored entry of one key, if any
    pub fn get_explicit_entry(&self, entity_id: EntityId, key: &AceKey) -> Option<AceInfo> {
        self.acls.get(&entity_id)?.get(key).copied()
    }

    /// The ACL object of an entity that holds one, with its parent link
    pub fn get_acl_info(&self, entity_id: EntityId) -> Option<AclInfo> {
        if !self.is_acl_holder(entity_id) {
            return None;
        }
        let entity = self.entities.get(&entity_id)?;
        let mut inherits = EntryTypeSet::empty();
        for entry_type in EntryType::ALL {
            if entity.inherits(entry_type) {
                inherits.insert(entry_type);
            }
        }
        Some(AclInfo {
            entity_id,
            inherits,
            entries: self.get_explicit_entries(entity_id, EntryTypeSet::all()),
            parent: self.parent_acl_holder(entity_id),
        })
    }

    /// ACL holders from the nearest (possibly the entity itself) to the
    /// farthest, ignoring inheritance breaks.
    pub fn acl_chain(&self, entity_id: EntityId) -> Vec<EntityId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.get_first_acl_holder(entity_id);
        while let Some(holder) = current {
            if !seen.insert(holder) {
                break;
            }
            chain.push(holder);
            current = self.parent_acl_holder(holder);
        }
        chain
    }

    /// Store or replace explicit entries by (entry type, identity, local-only)
    /// key. An entry with no allow and no deny bits removes the key.
    pub fn set_entries(&mut self, entity_id: EntityId, entries: &[AceInfo]) -> SecurityResult<()> {
        if !self.entity_or_resolve(entity_id) {
            return Err(SecurityError::EntityNotFound(entity_id));
        }
        let was_holder = self.is_acl_holder(entity_id);
        let stored = self.acls.entry(entity_id).or_default();
        for ace in entries {
            if ace.is_empty() {
                stored.remove(&ace.key());
            } else {
                stored.insert(ace.key(), *ace);
            }
        }
        if stored.is_empty() {
            self.acls.remove(&entity_id);
        }
        if was_holder != self.is_acl_holder(entity_id) {
            self.refresh_subtree(entity_id);
        }
        Ok(())
    }

    /// Apply a batch of ACL changes, breaks and undo-breaks in one step
    pub fn set_acls(
        &mut self,
        acls: &[AclInfo],
        breaks: &[(EntityId, EntryTypeSet)],
        undo_breaks: &[(EntityId, EntryTypeSet)],
    ) -> SecurityResult<()> {
        let named = acls
            .iter()
            .map(|acl| acl.entity_id)
            .chain(breaks.iter().map(|(id, _)| *id))
            .chain(undo_breaks.iter().map(|(id, _)| *id));
        for entity_id in named.collect::<Vec<_>>() {
            require_id(entity_id, "entity id")?;
            if !self.entity_or_resolve(entity_id) {
                return Err(SecurityError::EntityNotFound(entity_id));
            }
        }
        for (entity_id, types) in breaks {
            self.break_inheritance(*entity_id, *types)?;
        }
        for (entity_id, types) in undo_breaks {
            self.unbreak_inheritance(*entity_id, *types)?;
        }
        for acl in acls {
            self.set_entries(acl.entity_id, &acl.entries)?;
        }
        Ok(())
    }

    /// Remove every entry that refers to one of the identities
    pub fn remove_entries_of_identities(&mut self, identities: &[IdentityId]) -> Vec<EntityId> {
        let mut touched = Vec::new();
        for (entity_id, entries) in self.acls.iter_mut() {
            let before = entries.len();
            entries.retain(|key, _| !identities.contains(&key.identity_id));
            if entries.len() != before {
                touched.push(*entity_id);
            }
        }
        self.acls.retain(|_, entries| !entries.is_empty());
        for entity_id in &touched {
            self.refresh_subtree(*entity_id);
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::test_support::state_with;
    use crate::error::SecurityError;
    use crate::model::{AceInfo, AclInfo, EntryType, EntryTypeSet, PermissionBits};

    fn allow(entry_type: EntryType, identity: i32, bit: u8) -> AceInfo {
        AceInfo::new(entry_type, identity, false)
            .with_bits(PermissionBits::from_index(bit), PermissionBits::EMPTY)
    }

    #[test]
    fn test_set_entries_replaces_by_key() {
        let mut state = state_with(&[(1, 0, 1), (2, 1, 1), (5, 2, 1)]);
        state.set_entries(2, &[allow(EntryType::Normal, 10, 3)]).unwrap();
        state.set_entries(2, &[allow(EntryType::Normal, 10, 4)]).unwrap();

        let entries = state.get_explicit_entries(2, EntryTypeSet::all());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].allow_bits, PermissionBits::from_index(4));
        assert_eq!(state.get_first_acl_holder(5), Some(2));
    }

    #[test]
    fn test_normal_and_sharing_entries_stay_separate() {
        let mut state = state_with(&[(1, 0, 1), (2, 1, 1)]);
        state
            .set_entries(2, &[allow(EntryType::Normal, 10, 3), allow(EntryType::Sharing, 10, 12)])
            .unwrap();
        assert_eq!(state.get_explicit_entries(2, EntryTypeSet::all()).len(), 2);
        let sharing = state.get_explicit_entries(2, EntryTypeSet::of(&[EntryType::Sharing]));
        assert_eq!(sharing, vec![allow(EntryType::Sharing, 10, 12)]);
    }

    #[test]
    fn test_empty_entry_clears_key_and_holder() {
        let mut state = state_with(&[(1, 0, 1), (2, 1, 1), (5, 2, 1)]);
        state.set_entries(2, &[allow(EntryType::Normal, 10, 3)]).unwrap();
        state
            .set_entries(2, &[AceInfo::new(EntryType::Normal, 10, false)])
            .unwrap();
        assert!(state.get_explicit_entries(2, EntryTypeSet::all()).is_empty());
        assert_eq!(state.get_first_acl_holder(5), None);
        assert!(state.get_acl_info(2).is_none());
    }

    #[test]
    fn test_acl_chain_and_parent_links() {
        let mut state = state_with(&[(1, 0, 1), (2, 1, 1), (5, 2, 1), (14, 5, 1)]);
        state.set_entries(1, &[allow(EntryType::Normal, 10, 0)]).unwrap();
        state.set_entries(5, &[allow(EntryType::Normal, 10, 1)]).unwrap();
        assert_eq!(state.acl_chain(14), vec![5, 1]);
        assert_eq!(state.acl_chain(2), vec![1]);

        let acl = state.get_acl_info(5).unwrap();
        assert_eq!(acl.parent, Some(1));
        assert_eq!(acl.inherits, EntryTypeSet::all());
        assert_eq!(state.get_acl_info(1).unwrap().parent, None);
    }

    #[test]
    fn test_set_acls_applies_breaks_and_entries() {
        let mut state = state_with(&[(1, 0, 1), (2, 1, 1), (5, 2, 1)]);
        let acl = AclInfo::new(2).with_entries(vec![allow(EntryType::Normal, 10, 3)]);
        state
            .set_acls(&[acl], &[(5, EntryTypeSet::empty())], &[])
            .unwrap();
        assert_eq!(state.acl_chain(5), vec![5, 2]);
        assert!(state.get_acl_info(5).unwrap().inherits.is_empty());

        let missing = AclInfo::new(77).with_entries(vec![allow(EntryType::Normal, 10, 3)]);
        assert_eq!(
            state.set_acls(&[missing], &[], &[]),
            Err(SecurityError::EntityNotFound(77))
        );
    }

    #[test]
    fn test_remove_entries_of_identities() {
        let mut state = state_with(&[(1, 0, 1), (2, 1, 1)]);
        state
            .set_entries(2, &[allow(EntryType::Normal, 10, 3), allow(EntryType::Normal, 11, 3)])
            .unwrap();
        state.set_entries(1, &[allow(EntryType::Normal, 10, 0)]).unwrap();
        let mut touched = state.remove_entries_of_identities(&[10]);
        touched.sort_unstable();
        assert_eq!(touched, vec![1, 2]);
        assert!(state.get_acl_info(1).is_none());
        assert_eq!(state.get_explicit_entries(2, EntryTypeSet::all()).len(), 1);
    }
}
