use super::IdentityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Directed membership edge: `member_id` is a member of `group_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Membership {
    pub group_id: IdentityId,
    pub member_id: IdentityId,
    pub is_user: bool,
}

impl Membership {
    pub fn user(group_id: IdentityId, user_id: IdentityId) -> Self {
        Self {
            group_id,
            member_id: user_id,
            is_user: true,
        }
    }

    pub fn group(group_id: IdentityId, member_group_id: IdentityId) -> Self {
        Self {
            group_id,
            member_id: member_group_id,
            is_user: false,
        }
    }
}

/// A group with its direct members and direct parents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: IdentityId,
    pub user_member_ids: BTreeSet<IdentityId>,
    pub group_member_ids: BTreeSet<IdentityId>,
    pub parent_group_ids: BTreeSet<IdentityId>,
}

impl SecurityGroup {
    pub fn new(id: IdentityId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_member_ids.is_empty()
            && self.group_member_ids.is_empty()
            && self.parent_group_ids.is_empty()
    }
}
