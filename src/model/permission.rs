//! Permission bit masks and the built-in permission catalogue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Number of permission kinds a mask can address
pub const PERMISSION_COUNT: u8 = 64;

/// Fixed-width permission mask, one bit per permission kind.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionBits(pub u64);

impl PermissionBits {
    pub const EMPTY: PermissionBits = PermissionBits(0);
    pub const ALL: PermissionBits = PermissionBits(u64::MAX);

    /// Mask with the single bit `index` set. Indexes past the width yield an empty mask.
    pub fn from_index(index: u8) -> Self {
        if index >= PERMISSION_COUNT {
            return Self::EMPTY;
        }
        PermissionBits(1u64 << index)
    }

    pub fn from_indices(indices: &[u8]) -> Self {
        indices
            .iter()
            .fold(Self::EMPTY, |acc, i| acc | Self::from_index(*i))
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: PermissionBits) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: PermissionBits) -> bool {
        self.0 & other.0 != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Indexes of the set bits in ascending order
    pub fn indices(self) -> impl Iterator<Item = u8> {
        (0..PERMISSION_COUNT).filter(move |i| self.0 & (1u64 << i) != 0)
    }
}

impl fmt::Debug for PermissionBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PermissionBits({:#018x})", self.0)
    }
}

impl BitOr for PermissionBits {
    type Output = PermissionBits;
    fn bitor(self, rhs: Self) -> Self {
        PermissionBits(self.0 | rhs.0)
    }
}

impl BitOrAssign for PermissionBits {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PermissionBits {
    type Output = PermissionBits;
    fn bitand(self, rhs: Self) -> Self {
        PermissionBits(self.0 & rhs.0)
    }
}

impl BitAndAssign for PermissionBits {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for PermissionBits {
    type Output = PermissionBits;
    fn not(self) -> Self {
        PermissionBits(!self.0)
    }
}

impl From<PermissionType> for PermissionBits {
    fn from(permission: PermissionType) -> Self {
        permission.mask()
    }
}

/// Outcome of evaluating one permission bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionValue {
    Undefined,
    Allowed,
    Denied,
}

/// Filter used by the related-identity/entity queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionLevel {
    Allowed,
    Denied,
    AllowedOrDenied,
}

impl PermissionLevel {
    /// Whether an entry with the given bits matches `mask` at this level
    pub fn matches(self, allow: PermissionBits, deny: PermissionBits, mask: PermissionBits) -> bool {
        match self {
            PermissionLevel::Allowed => allow.intersects(mask),
            PermissionLevel::Denied => deny.intersects(mask),
            PermissionLevel::AllowedOrDenied => (allow | deny).intersects(mask),
        }
    }
}

/// A named permission kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermissionType {
    pub index: u8,
    pub name: &'static str,
    /// Permissions that must also be allowed when this one is allowed
    depends_on: &'static [u8],
}

impl PermissionType {
    pub const fn new(index: u8, name: &'static str, depends_on: &'static [u8]) -> Self {
        Self {
            index,
            name,
            depends_on,
        }
    }

    pub fn mask(&self) -> PermissionBits {
        PermissionBits::from_index(self.index)
    }

    pub const SEE: PermissionType = PermissionType::new(0, "See", &[]);
    pub const PREVIEW: PermissionType = PermissionType::new(1, "Preview", &[0]);
    pub const PREVIEW_WITHOUT_WATERMARK: PermissionType =
        PermissionType::new(2, "PreviewWithoutWatermark", &[1]);
    pub const PREVIEW_WITHOUT_REDACTION: PermissionType =
        PermissionType::new(3, "PreviewWithoutRedaction", &[1]);
    pub const OPEN: PermissionType = PermissionType::new(4, "Open", &[2, 3]);
    pub const OPEN_MINOR: PermissionType = PermissionType::new(5, "OpenMinor", &[4]);
    pub const SAVE: PermissionType = PermissionType::new(6, "Save", &[5]);
    pub const PUBLISH: PermissionType = PermissionType::new(7, "Publish", &[6]);
    pub const FORCE_CHECKIN: PermissionType = PermissionType::new(8, "ForceCheckin", &[6]);
    pub const ADD_NEW: PermissionType = PermissionType::new(9, "AddNew", &[6]);
    pub const APPROVE: PermissionType = PermissionType::new(10, "Approve", &[6]);
    pub const DELETE: PermissionType = PermissionType::new(11, "Delete", &[6]);
    pub const RECALL_OLD_VERSION: PermissionType =
        PermissionType::new(12, "RecallOldVersion", &[6]);
    pub const DELETE_OLD_VERSION: PermissionType =
        PermissionType::new(13, "DeleteOldVersion", &[6]);
    pub const SEE_PERMISSIONS: PermissionType = PermissionType::new(14, "SeePermissions", &[0]);
    pub const SET_PERMISSIONS: PermissionType = PermissionType::new(15, "SetPermissions", &[14]);
    pub const RUN_APPLICATION: PermissionType = PermissionType::new(16, "RunApplication", &[4]);
    pub const MANAGE_LISTS_AND_WORKSPACES: PermissionType =
        PermissionType::new(17, "ManageListsAndWorkspaces", &[6]);
    pub const TAKE_OWNERSHIP: PermissionType = PermissionType::new(18, "TakeOwnership", &[6]);

    /// Index of `Custom01`; custom permissions run up to the last bit
    pub const FIRST_CUSTOM_INDEX: u8 = 32;

    /// All named built-in permissions in index order (customs excluded)
    pub fn builtins() -> &'static [PermissionType] {
        &BUILTIN_PERMISSIONS
    }

    /// Look up a permission by index. Unnamed indexes below the custom
    /// range have no type.
    pub fn by_index(index: u8) -> Option<PermissionType> {
        if let Some(p) = BUILTIN_PERMISSIONS.iter().find(|p| p.index == index) {
            return Some(*p);
        }
        if (Self::FIRST_CUSTOM_INDEX..PERMISSION_COUNT).contains(&index) {
            return Some(PermissionType::new(
                index,
                CUSTOM_NAMES[(index - Self::FIRST_CUSTOM_INDEX) as usize],
                &[],
            ));
        }
        None
    }

    /// Look up a permission by name (case-insensitive)
    pub fn by_name(name: &str) -> Option<PermissionType> {
        if let Some(p) = BUILTIN_PERMISSIONS
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        {
            return Some(*p);
        }
        CUSTOM_NAMES
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .and_then(|pos| Self::by_index(Self::FIRST_CUSTOM_INDEX + pos as u8))
    }

    /// `mask` plus every permission it transitively depends on.
    /// Used when allowing: allowing Open also allows See.
    pub fn with_allow_dependencies(mask: PermissionBits) -> PermissionBits {
        let mut result = mask;
        loop {
            let mut next = result;
            for p in BUILTIN_PERMISSIONS.iter().filter(|p| result.contains(p.mask())) {
                next |= PermissionBits::from_indices(p.depends_on);
            }
            if next == result {
                return result;
            }
            result = next;
        }
    }

    /// `mask` plus every permission that transitively depends on it.
    /// Used when denying: denying See also denies Open.
    pub fn with_deny_dependents(mask: PermissionBits) -> PermissionBits {
        let mut result = mask;
        loop {
            let mut next = result;
            for p in BUILTIN_PERMISSIONS.iter() {
                if result.intersects(PermissionBits::from_indices(p.depends_on)) {
                    next |= p.mask();
                }
            }
            if next == result {
                return result;
            }
            result = next;
        }
    }
}

static BUILTIN_PERMISSIONS: [PermissionType; 19] = [
    PermissionType::SEE,
    PermissionType::PREVIEW,
    PermissionType::PREVIEW_WITHOUT_WATERMARK,
    PermissionType::PREVIEW_WITHOUT_REDACTION,
    PermissionType::OPEN,
    PermissionType::OPEN_MINOR,
    PermissionType::SAVE,
    PermissionType::PUBLISH,
    PermissionType::FORCE_CHECKIN,
    PermissionType::ADD_NEW,
    PermissionType::APPROVE,
    PermissionType::DELETE,
    PermissionType::RECALL_OLD_VERSION,
    PermissionType::DELETE_OLD_VERSION,
    PermissionType::SEE_PERMISSIONS,
    PermissionType::SET_PERMISSIONS,
    PermissionType::RUN_APPLICATION,
    PermissionType::MANAGE_LISTS_AND_WORKSPACES,
    PermissionType::TAKE_OWNERSHIP,
];

static CUSTOM_NAMES: [&str; 32] = [
    "Custom01", "Custom02", "Custom03", "Custom04", "Custom05", "Custom06", "Custom07",
    "Custom08", "Custom09", "Custom10", "Custom11", "Custom12", "Custom13", "Custom14",
    "Custom15", "Custom16", "Custom17", "Custom18", "Custom19", "Custom20", "Custom21",
    "Custom22", "Custom23", "Custom24", "Custom25", "Custom26", "Custom27", "Custom28",
    "Custom29", "Custom30", "Custom31", "Custom32",
];
