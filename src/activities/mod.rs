//! # Security Activities
//!
//! An activity is one atomic change: it is saved, ordered by the
//! [`ActivityQueue`](crate::queue::ActivityQueue), stored, applied to the
//! cache exactly once and distributed to the other nodes.
//!
//! Every activity exposes three capabilities:
//!
//! - [`SecurityActivity::affected_ids`] - the entity ids its correctness
//!   depends on, snapshotted against the tree when it arrives
//! - [`SecurityActivity::store`] - writes its rows through the data provider
//! - [`SecurityActivity::apply`] - mutates the cache state
//!
//! Two activities conflict when their affected sets intersect. Membership
//! activities affect everything.

pub mod acl;
pub mod entity;
pub mod membership;

use crate::cache::CacheState;
use crate::data::SecurityDataProvider;
use crate::error::SecurityResult;
use crate::model::{require_id, AclInfo, ActivityId, EntityId, EntryTypeSet, IdentityId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Payload of an activity; `type` is the wire discriminator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActivityKind {
    CreateEntity {
        entity_id: EntityId,
        parent_id: EntityId,
        owner_id: IdentityId,
    },
    DeleteEntity {
        entity_id: EntityId,
    },
    ModifyOwner {
        entity_id: EntityId,
        owner_id: IdentityId,
    },
    MoveEntity {
        source_id: EntityId,
        target_id: EntityId,
    },
    SetAcl {
        #[serde(default)]
        acls: Vec<AclInfo>,
        #[serde(default)]
        breaks: Vec<(EntityId, EntryTypeSet)>,
        #[serde(default)]
        undo_breaks: Vec<(EntityId, EntryTypeSet)>,
    },
    AddMembersToGroup {
        group_id: IdentityId,
        #[serde(default)]
        user_members: Vec<IdentityId>,
        #[serde(default)]
        group_members: Vec<IdentityId>,
        #[serde(default)]
        parent_groups: Vec<IdentityId>,
    },
    RemoveMembersFromGroup {
        group_id: IdentityId,
        #[serde(default)]
        user_members: Vec<IdentityId>,
        #[serde(default)]
        group_members: Vec<IdentityId>,
        #[serde(default)]
        parent_groups: Vec<IdentityId>,
    },
    AddUserToSecurityGroups {
        user_id: IdentityId,
        parent_groups: Vec<IdentityId>,
    },
    RemoveUserFromSecurityGroups {
        user_id: IdentityId,
        parent_groups: Vec<IdentityId>,
    },
    DeleteUser {
        user_id: IdentityId,
    },
    DeleteGroup {
        group_id: IdentityId,
    },
    DeleteIdentities {
        identities: Vec<IdentityId>,
    },
}

impl ActivityKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActivityKind::CreateEntity { .. } => "CreateEntity",
            ActivityKind::DeleteEntity { .. } => "DeleteEntity",
            ActivityKind::ModifyOwner { .. } => "ModifyOwner",
            ActivityKind::MoveEntity { .. } => "MoveEntity",
            ActivityKind::SetAcl { .. } => "SetAcl",
            ActivityKind::AddMembersToGroup { .. } => "AddMembersToGroup",
            ActivityKind::RemoveMembersFromGroup { .. } => "RemoveMembersFromGroup",
            ActivityKind::AddUserToSecurityGroups { .. } => "AddUserToSecurityGroups",
            ActivityKind::RemoveUserFromSecurityGroups { .. } => "RemoveUserFromSecurityGroups",
            ActivityKind::DeleteUser { .. } => "DeleteUser",
            ActivityKind::DeleteGroup { .. } => "DeleteGroup",
            ActivityKind::DeleteIdentities { .. } => "DeleteIdentities",
        }
    }

    pub fn is_membership(&self) -> bool {
        matches!(
            self,
            ActivityKind::AddMembersToGroup { .. }
                | ActivityKind::RemoveMembersFromGroup { .. }
                | ActivityKind::AddUserToSecurityGroups { .. }
                | ActivityKind::RemoveUserFromSecurityGroups { .. }
                | ActivityKind::DeleteUser { .. }
                | ActivityKind::DeleteGroup { .. }
                | ActivityKind::DeleteIdentities { .. }
        )
    }
}

/// The entity ids an activity depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffectedIds {
    /// Conflicts with every other activity
    Everything,
    Entities(BTreeSet<EntityId>),
}

impl AffectedIds {
    pub fn conflicts_with(&self, other: &AffectedIds) -> bool {
        match (self, other) {
            (AffectedIds::Everything, _) | (_, AffectedIds::Everything) => true,
            (AffectedIds::Entities(a), AffectedIds::Entities(b)) => !a.is_disjoint(b),
        }
    }
}

/// One unit of change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityActivity {
    /// Assigned when saved; zero before that
    #[serde(default)]
    pub id: ActivityId,
    /// Identity of the activity object, stable across redelivery
    pub uuid: Uuid,
    pub kind: ActivityKind,
    pub created_at: DateTime<Utc>,
    /// Node that created the activity
    #[serde(default)]
    pub sender: Option<String>,
    /// Arrived from another node
    #[serde(skip)]
    pub from_receiver: bool,
    /// Reloaded from the data provider
    #[serde(skip)]
    pub from_database: bool,
}

impl SecurityActivity {
    pub fn new(kind: ActivityKind) -> Self {
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            kind,
            created_at: Utc::now(),
            sender: None,
            from_receiver: false,
            from_database: false,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Created on this node: runs the Store phase and is sent to peers
    pub fn is_local(&self) -> bool {
        !self.from_receiver && !self.from_database
    }

    /// Reject default ids before the activity is saved
    pub fn validate(&self) -> SecurityResult<()> {
        match &self.kind {
            ActivityKind::CreateEntity {
                entity_id,
                owner_id,
                ..
            } => {
                require_id(*entity_id, "entity id")?;
                require_id(*owner_id, "owner id")
            }
            ActivityKind::DeleteEntity { entity_id } => require_id(*entity_id, "entity id"),
            ActivityKind::ModifyOwner {
                entity_id,
                owner_id,
            } => {
                require_id(*entity_id, "entity id")?;
                require_id(*owner_id, "owner id")
            }
            ActivityKind::MoveEntity {
                source_id,
                target_id,
            } => {
                require_id(*source_id, "source entity id")?;
                require_id(*target_id, "target entity id")
            }
            ActivityKind::SetAcl { .. } => acl::validate(&self.kind),
            _ => membership::validate(&self.kind),
        }
    }

    /// Entity ids this activity depends on, against the current tree
    pub fn affected_ids(&self, state: &CacheState) -> AffectedIds {
        if self.kind.is_membership() {
            return AffectedIds::Everything;
        }
        let ids = match &self.kind {
            ActivityKind::SetAcl {
                acls,
                breaks,
                undo_breaks,
            } => acl::affected_ids(state, acls, breaks, undo_breaks),
            _ => entity::affected_ids(state, &self.kind),
        };
        AffectedIds::Entities(ids)
    }

    /// Whether this activity must wait for the older one
    pub fn should_wait_for(&self, older: &SecurityActivity, state: &CacheState) -> bool {
        if self.uuid == older.uuid {
            return false;
        }
        self.affected_ids(state)
            .conflicts_with(&older.affected_ids(state))
    }

    /// Write the rows of this activity through the data provider
    pub async fn store(&self, data: &dyn SecurityDataProvider) -> SecurityResult<()> {
        match &self.kind {
            ActivityKind::SetAcl { .. } => acl::store(&self.kind, data).await,
            kind if kind.is_membership() => membership::store(kind, data).await,
            kind => entity::store(kind, data).await,
        }
    }

    /// Mutate the cache state. Runs under the cache write lock.
    pub fn apply(&self, state: &mut CacheState) -> SecurityResult<()> {
        match &self.kind {
            ActivityKind::SetAcl {
                acls,
                breaks,
                undo_breaks,
            } => state.set_acls(acls, breaks, undo_breaks),
            kind if kind.is_membership() => membership::apply(kind, state),
            kind => entity::apply(kind, state),
        }
    }

    pub fn to_json(&self) -> SecurityResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> SecurityResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::state_with;
    use crate::error::SecurityError;

    fn all_kinds() -> Vec<ActivityKind> {
        vec![
            ActivityKind::CreateEntity {
                entity_id: 20,
                parent_id: 2,
                owner_id: 1,
            },
            ActivityKind::DeleteEntity { entity_id: 5 },
            ActivityKind::ModifyOwner {
                entity_id: 14,
                owner_id: 3,
            },
            ActivityKind::MoveEntity {
                source_id: 5,
                target_id: 3,
            },
            ActivityKind::SetAcl {
                acls: vec![AclInfo::new(3)],
                breaks: Vec::new(),
                undo_breaks: Vec::new(),
            },
            ActivityKind::AddMembersToGroup {
                group_id: 900,
                user_members: vec![101],
                group_members: Vec::new(),
                parent_groups: Vec::new(),
            },
            ActivityKind::DeleteIdentities {
                identities: vec![101],
            },
        ]
    }

    #[test]
    fn test_membership_conflicts_with_everything() {
        let state = state_with(&[(1, 0, 1), (2, 1, 1), (3, 1, 1), (5, 2, 1), (14, 5, 1)]);
        let membership = SecurityActivity::new(ActivityKind::DeleteGroup { group_id: 900 });
        for kind in all_kinds() {
            let other = SecurityActivity::new(kind);
            assert!(membership.should_wait_for(&other, &state), "{}", other.name());
            assert!(other.should_wait_for(&membership, &state), "{}", other.name());
        }
    }

    #[test]
    fn test_disjoint_trees_do_not_conflict() {
        // 1 -> 2 -> 5 and a second root 3 -> 7
        let state = state_with(&[(1, 0, 1), (2, 1, 1), (5, 2, 1), (3, 0, 1), (7, 3, 1)]);
        let owner_5 = SecurityActivity::new(ActivityKind::ModifyOwner {
            entity_id: 5,
            owner_id: 9,
        });
        let owner_7 = SecurityActivity::new(ActivityKind::ModifyOwner {
            entity_id: 7,
            owner_id: 9,
        });
        assert!(!owner_5.should_wait_for(&owner_7, &state));

        let delete_2 = SecurityActivity::new(ActivityKind::DeleteEntity { entity_id: 2 });
        assert!(owner_5.should_wait_for(&delete_2, &state));
        assert!(!delete_2.should_wait_for(&owner_7, &state));

        // Siblings share their ancestors
        let owner_2 = SecurityActivity::new(ActivityKind::ModifyOwner {
            entity_id: 2,
            owner_id: 9,
        });
        assert!(owner_2.should_wait_for(&owner_5, &state));
        assert!(!owner_2.should_wait_for(&owner_7, &state));
    }

    #[test]
    fn test_validate_rejects_default_ids() {
        let activity = SecurityActivity::new(ActivityKind::CreateEntity {
            entity_id: 0,
            parent_id: 1,
            owner_id: 1,
        });
        assert!(matches!(activity.validate(), Err(SecurityError::InvalidArgument(_))));
        let activity = SecurityActivity::new(ActivityKind::DeleteGroup { group_id: 0 });
        assert!(matches!(activity.validate(), Err(SecurityError::InvalidArgument(_))));
        let activity = SecurityActivity::new(ActivityKind::MoveEntity {
            source_id: 4,
            target_id: 5,
        });
        assert!(activity.validate().is_ok());
    }

    #[test]
    fn test_wire_shape_carries_discriminator() {
        let mut activity = SecurityActivity::new(ActivityKind::MoveEntity {
            source_id: 4,
            target_id: 5,
        });
        activity.id = 17;
        activity.from_receiver = true;
        let json: serde_json::Value = serde_json::from_str(&activity.to_json().unwrap()).unwrap();
        assert_eq!(json["id"], 17);
        assert_eq!(json["kind"]["type"], "MoveEntity");
        assert_eq!(json["kind"]["source_id"], 4);

        let back = SecurityActivity::from_json(&json.to_string()).unwrap();
        assert_eq!(back.kind, activity.kind);
        assert!(!back.from_receiver);
    }
}
