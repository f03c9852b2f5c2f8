//! Membership activities. They change identity resolution for every
//! entity, so each one conflicts with every other activity.

use super::ActivityKind;
use crate::cache::CacheState;
use crate::data::SecurityDataProvider;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{require_id, IdentityId, Membership};

pub(crate) fn validate(kind: &ActivityKind) -> SecurityResult<()> {
    match kind {
        ActivityKind::AddMembersToGroup { group_id, .. }
        | ActivityKind::RemoveMembersFromGroup { group_id, .. }
        | ActivityKind::DeleteGroup { group_id } => require_id(*group_id, "group id"),
        ActivityKind::AddUserToSecurityGroups { user_id, .. }
        | ActivityKind::RemoveUserFromSecurityGroups { user_id, .. }
        | ActivityKind::DeleteUser { user_id } => require_id(*user_id, "user id"),
        ActivityKind::DeleteIdentities { identities } => {
            for id in identities {
                require_id(*id, "identity id")?;
            }
            Ok(())
        }
        other => Err(SecurityError::Internal(format!(
            "{} is not a membership activity",
            other.name()
        ))),
    }
}

/// Direct edges named by a group-centred activity
fn group_edges(
    group_id: IdentityId,
    user_members: &[IdentityId],
    group_members: &[IdentityId],
    parent_groups: &[IdentityId],
) -> Vec<Membership> {
    user_members
        .iter()
        .map(|u| Membership::user(group_id, *u))
        .chain(group_members.iter().map(|g| Membership::group(group_id, *g)))
        .chain(parent_groups.iter().map(|p| Membership::group(*p, group_id)))
        .collect()
}

fn user_edges(user_id: IdentityId, parent_groups: &[IdentityId]) -> Vec<Membership> {
    parent_groups
        .iter()
        .map(|g| Membership::user(*g, user_id))
        .collect()
}

pub(crate) fn apply(kind: &ActivityKind, state: &mut CacheState) -> SecurityResult<()> {
    match kind {
        ActivityKind::AddMembersToGroup {
            group_id,
            user_members,
            group_members,
            parent_groups,
        } => state.add_members_to_group(*group_id, user_members, group_members, parent_groups),
        ActivityKind::RemoveMembersFromGroup {
            group_id,
            user_members,
            group_members,
            parent_groups,
        } => state.remove_members_from_group(*group_id, user_members, group_members, parent_groups),
        ActivityKind::AddUserToSecurityGroups {
            user_id,
            parent_groups,
        } => state.add_user_to_groups(*user_id, parent_groups),
        ActivityKind::RemoveUserFromSecurityGroups {
            user_id,
            parent_groups,
        } => state.remove_user_from_groups(*user_id, parent_groups),
        ActivityKind::DeleteUser { user_id } => state.delete_user(*user_id),
        ActivityKind::DeleteGroup { group_id } => state.delete_group(*group_id),
        ActivityKind::DeleteIdentities { identities } => state.delete_identities(identities),
        ActivityKind::CreateEntity { .. }
        | ActivityKind::DeleteEntity { .. }
        | ActivityKind::ModifyOwner { .. }
        | ActivityKind::MoveEntity { .. }
        | ActivityKind::SetAcl { .. } => {
            return Err(SecurityError::Internal(format!(
                "{} is not a membership activity",
                kind.name()
            )))
        }
    }
    Ok(())
}

pub(crate) async fn store(kind: &ActivityKind, data: &dyn SecurityDataProvider) -> SecurityResult<()> {
    match kind {
        ActivityKind::AddMembersToGroup {
            group_id,
            user_members,
            group_members,
            parent_groups,
        } => {
            data.add_memberships(&group_edges(*group_id, user_members, group_members, parent_groups))
                .await
        }
        ActivityKind::RemoveMembersFromGroup {
            group_id,
            user_members,
            group_members,
            parent_groups,
        } => {
            data.remove_memberships(&group_edges(*group_id, user_members, group_members, parent_groups))
                .await
        }
        ActivityKind::AddUserToSecurityGroups {
            user_id,
            parent_groups,
        } => data.add_memberships(&user_edges(*user_id, parent_groups)).await,
        ActivityKind::RemoveUserFromSecurityGroups {
            user_id,
            parent_groups,
        } => data.remove_memberships(&user_edges(*user_id, parent_groups)).await,
        ActivityKind::DeleteUser { user_id } => data.delete_identities(&[*user_id]).await,
        ActivityKind::DeleteGroup { group_id } => data.delete_identities(&[*group_id]).await,
        ActivityKind::DeleteIdentities { identities } => data.delete_identities(identities).await,
        other => Err(SecurityError::Internal(format!(
            "{} is not a membership activity",
            other.name()
        ))),
    }
}
