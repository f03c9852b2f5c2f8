//! Access control entries and lists.

use super::permission::{PermissionBits, PermissionType, PermissionValue};
use super::{EntityId, IdentityId};
use serde::{Deserialize, Serialize};

/// The two independently inherited permission layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryType {
    Normal,
    Sharing,
}

impl EntryType {
    pub const ALL: [EntryType; 2] = [EntryType::Normal, EntryType::Sharing];

    fn bit(self) -> u8 {
        match self {
            EntryType::Normal => 0b01,
            EntryType::Sharing => 0b10,
        }
    }
}

/// Small set of entry types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryTypeSet(u8);

impl EntryTypeSet {
    pub const fn empty() -> Self {
        EntryTypeSet(0)
    }

    pub fn all() -> Self {
        Self::of(&EntryType::ALL)
    }

    pub fn of(types: &[EntryType]) -> Self {
        EntryTypeSet(types.iter().fold(0, |acc, t| acc | t.bit()))
    }

    pub fn contains(self, entry_type: EntryType) -> bool {
        self.0 & entry_type.bit() != 0
    }

    pub fn insert(&mut self, entry_type: EntryType) {
        self.0 |= entry_type.bit();
    }

    pub fn remove(&mut self, entry_type: EntryType) {
        self.0 &= !entry_type.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: EntryTypeSet) -> EntryTypeSet {
        EntryTypeSet(self.0 | other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = EntryType> {
        EntryType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

/// Uniqueness key of an entry on one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AceKey {
    pub entry_type: EntryType,
    pub identity_id: IdentityId,
    pub local_only: bool,
}

/// One explicit permission entry for an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AceInfo {
    pub entry_type: EntryType,
    pub identity_id: IdentityId,
    pub local_only: bool,
    pub allow_bits: PermissionBits,
    pub deny_bits: PermissionBits,
}

impl AceInfo {
    pub fn new(entry_type: EntryType, identity_id: IdentityId, local_only: bool) -> Self {
        Self {
            entry_type,
            identity_id,
            local_only,
            allow_bits: PermissionBits::EMPTY,
            deny_bits: PermissionBits::EMPTY,
        }
    }

    pub fn with_bits(mut self, allow_bits: PermissionBits, deny_bits: PermissionBits) -> Self {
        self.allow_bits = allow_bits;
        self.deny_bits = deny_bits;
        self
    }

    pub fn key(&self) -> AceKey {
        AceKey {
            entry_type: self.entry_type,
            identity_id: self.identity_id,
            local_only: self.local_only,
        }
    }

    /// An entry that neither allows nor denies anything carries no information
    pub fn is_empty(&self) -> bool {
        self.allow_bits.is_empty() && self.deny_bits.is_empty()
    }
}

/// Persisted form of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredAce {
    pub entity_id: EntityId,
    pub entry_type: EntryType,
    pub identity_id: IdentityId,
    pub local_only: bool,
    pub allow_bits: PermissionBits,
    pub deny_bits: PermissionBits,
}

impl StoredAce {
    pub fn new(entity_id: EntityId, ace: &AceInfo) -> Self {
        Self {
            entity_id,
            entry_type: ace.entry_type,
            identity_id: ace.identity_id,
            local_only: ace.local_only,
            allow_bits: ace.allow_bits,
            deny_bits: ace.deny_bits,
        }
    }

    pub fn ace(&self) -> AceInfo {
        AceInfo {
            entry_type: self.entry_type,
            identity_id: self.identity_id,
            local_only: self.local_only,
            allow_bits: self.allow_bits,
            deny_bits: self.deny_bits,
        }
    }

    pub fn key(&self) -> AceKey {
        self.ace().key()
    }
}

/// ACL of one entity: explicit entries plus the nearest ancestor ACL holder.
///
/// Carried by SetAcl activities (the entries to store) and returned by the
/// cache for entities that hold an ACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclInfo {
    pub entity_id: EntityId,
    /// Entry types still inherited from above
    pub inherits: EntryTypeSet,
    pub entries: Vec<AceInfo>,
    /// Nearest ancestor that holds an ACL, computed by the cache
    #[serde(default)]
    pub parent: Option<EntityId>,
}

impl AclInfo {
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            inherits: EntryTypeSet::all(),
            entries: Vec::new(),
            parent: None,
        }
    }

    pub fn with_entries(mut self, entries: Vec<AceInfo>) -> Self {
        self.entries = entries;
        self
    }

    pub fn inherits(&self, entry_type: EntryType) -> bool {
        self.inherits.contains(entry_type)
    }
}

/// Display entry of an access control list: the merged state of one
/// (identity, entry type, local-only) key, with the source of every bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub identity_id: IdentityId,
    pub entry_type: EntryType,
    pub local_only: bool,
    pub allow_bits: PermissionBits,
    pub deny_bits: PermissionBits,
    /// Per defined bit: (bit index, value, entity the value comes from)
    pub sources: Vec<(u8, PermissionValue, EntityId)>,
}

impl AccessControlEntry {
    /// Value of a single permission in this entry
    pub fn value_of(&self, permission: PermissionType) -> PermissionValue {
        self.sources
            .iter()
            .find(|(index, _, _)| *index == permission.index)
            .map(|(_, value, _)| *value)
            .unwrap_or(PermissionValue::Undefined)
    }

    /// Whether any bit of the entry is inherited from another entity
    pub fn is_inherited_from_elsewhere(&self, entity_id: EntityId) -> bool {
        self.sources.iter().any(|(_, _, from)| *from != entity_id)
    }
}

/// Root-to-self merged view of an entity's permissions, for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlList {
    pub entity_id: EntityId,
    pub inherits: EntryTypeSet,
    pub entries: Vec<AccessControlEntry>,
}

impl AccessControlList {
    pub fn entry(&self, identity_id: IdentityId, entry_type: EntryType) -> Option<&AccessControlEntry> {
        self.entries
            .iter()
            .find(|e| e.identity_id == identity_id && e.entry_type == entry_type)
    }
}
