//! Core data model: ids, permission masks, entities, ACL entries and
//! memberships. Everything here is plain data; the cache owns the live
//! structures built from it.

pub mod acl;
pub mod entity;
pub mod membership;
pub mod permission;

pub use acl::{AccessControlEntry, AccessControlList, AceInfo, AceKey, AclInfo, EntryType, EntryTypeSet, StoredAce};
pub use entity::{SecurityEntity, StoredSecurityEntity};
pub use membership::{Membership, SecurityGroup};
pub use permission::{PermissionBits, PermissionLevel, PermissionType, PermissionValue};

use crate::error::{SecurityError, SecurityResult};

/// Id of a securable entity. Zero is the default/absent id.
pub type EntityId = i32;
/// Id of a user or group. Zero is the default/absent id.
pub type IdentityId = i32;
/// Id assigned to an activity when it is saved. Zero means "not saved yet".
pub type ActivityId = i32;

/// Reject the default id with `InvalidArgument`.
pub fn require_id(id: i32, what: &str) -> SecurityResult<()> {
    if id == 0 {
        return Err(SecurityError::InvalidArgument(format!(
            "{} cannot be the default id",
            what
        )));
    }
    Ok(())
}
