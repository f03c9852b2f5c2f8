use super::acl::{EntryType, EntryTypeSet};
use super::{EntityId, IdentityId};
use serde::{Deserialize, Serialize};

/// Persisted row of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredSecurityEntity {
    pub id: EntityId,
    /// Zero for a root entity
    pub parent_id: EntityId,
    pub owner_id: IdentityId,
    /// Entry types whose inheritance is broken on this entity
    #[serde(default)]
    pub inheritance_breaks: EntryTypeSet,
}

impl StoredSecurityEntity {
    pub fn new(id: EntityId, parent_id: EntityId, owner_id: IdentityId) -> Self {
        Self {
            id,
            parent_id,
            owner_id,
            inheritance_breaks: EntryTypeSet::empty(),
        }
    }

    pub fn is_inherited(&self) -> bool {
        self.inheritance_breaks.is_empty()
    }
}

/// Live entity held by the cache.
///
/// `parent_id` and `children` are cache-internal links; `level` is kept equal
/// to the parent's level plus one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEntity {
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
    pub owner_id: IdentityId,
    pub level: u32,
    pub children: Vec<EntityId>,
    pub inheritance_breaks: EntryTypeSet,
    /// Nearest entity (self included) that holds an ACL
    pub(crate) first_acl_holder: Option<EntityId>,
}

impl SecurityEntity {
    pub(crate) fn new(id: EntityId, parent_id: Option<EntityId>, owner_id: IdentityId, level: u32) -> Self {
        Self {
            id,
            parent_id,
            owner_id,
            level,
            children: Vec::new(),
            inheritance_breaks: EntryTypeSet::empty(),
            first_acl_holder: None,
        }
    }

    /// True when no entry type has its inheritance broken here
    pub fn is_inherited(&self) -> bool {
        self.inheritance_breaks.is_empty()
    }

    pub fn inherits(&self, entry_type: EntryType) -> bool {
        !self.inheritance_breaks.contains(entry_type)
    }

    pub fn first_acl_holder(&self) -> Option<EntityId> {
        self.first_acl_holder
    }

    pub fn to_stored(&self) -> StoredSecurityEntity {
        StoredSecurityEntity {
            id: self.id,
            parent_id: self.parent_id.unwrap_or(0),
            owner_id: self.owner_id,
            inheritance_breaks: self.inheritance_breaks,
        }
    }
}
