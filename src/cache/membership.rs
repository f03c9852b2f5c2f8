//! Group membership on the cache state.
//!
//! Direct edges are kept on [`SecurityGroup`] and in `user_groups`; after
//! every change the user-to-all-groups closure is rebuilt. Group cycles are
//! tolerated: the closure walk never revisits a group.

use super::CacheState;
use crate::model::{IdentityId, Membership, SecurityGroup};
use std::collections::{BTreeSet, VecDeque};

impl CacheState {
    pub fn is_group(&self, identity_id: IdentityId) -> bool {
        self.groups.contains_key(&identity_id)
    }

    pub fn get_group(&self, group_id: IdentityId) -> Option<&SecurityGroup> {
        self.groups.get(&group_id)
    }

    fn group_mut(&mut self, group_id: IdentityId) -> &mut SecurityGroup {
        self.groups
            .entry(group_id)
            .or_insert_with(|| SecurityGroup::new(group_id))
    }

    /// Insert a direct edge without rebuilding the closure
    pub(crate) fn insert_membership(&mut self, membership: Membership) {
        let Membership {
            group_id,
            member_id,
            is_user,
        } = membership;
        if group_id == 0 || member_id == 0 || group_id == member_id {
            return;
        }
        if is_user {
            self.group_mut(group_id).user_member_ids.insert(member_id);
            self.user_groups.entry(member_id).or_default().insert(group_id);
        } else {
            self.group_mut(group_id).group_member_ids.insert(member_id);
            self.group_mut(member_id).parent_group_ids.insert(group_id);
        }
    }

    /// Remove a direct edge without rebuilding the closure
    pub(crate) fn remove_membership(&mut self, membership: Membership) {
        let Membership {
            group_id,
            member_id,
            is_user,
        } = membership;
        if is_user {
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.user_member_ids.remove(&member_id);
            }
            if let Some(parents) = self.user_groups.get_mut(&member_id) {
                parents.remove(&group_id);
                if parents.is_empty() {
                    self.user_groups.remove(&member_id);
                }
            }
        } else {
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.group_member_ids.remove(&member_id);
            }
            if let Some(member) = self.groups.get_mut(&member_id) {
                member.parent_group_ids.remove(&group_id);
            }
        }
    }

    /// Add users and groups to `group_id` and `group_id` to `parent_groups`
    pub fn add_members_to_group(
        &mut self,
        group_id: IdentityId,
        user_members: &[IdentityId],
        group_members: &[IdentityId],
        parent_groups: &[IdentityId],
    ) {
        if group_id == 0 {
            return;
        }
        self.group_mut(group_id);
        for user in user_members {
            self.insert_membership(Membership::user(group_id, *user));
        }
        for member in group_members {
            self.insert_membership(Membership::group(group_id, *member));
        }
        for parent in parent_groups {
            self.insert_membership(Membership::group(*parent, group_id));
        }
        self.recompute_flattened();
    }

    pub fn remove_members_from_group(
        &mut self,
        group_id: IdentityId,
        user_members: &[IdentityId],
        group_members: &[IdentityId],
        parent_groups: &[IdentityId],
    ) {
        for user in user_members {
            self.remove_membership(Membership::user(group_id, *user));
        }
        for member in group_members {
            self.remove_membership(Membership::group(group_id, *member));
        }
        for parent in parent_groups {
            self.remove_membership(Membership::group(*parent, group_id));
        }
        self.recompute_flattened();
    }

    pub fn add_user_to_groups(&mut self, user_id: IdentityId, parent_groups: &[IdentityId]) {
        for group in parent_groups {
            self.insert_membership(Membership::user(*group, user_id));
        }
        self.recompute_flattened();
    }

    pub fn remove_user_from_groups(&mut self, user_id: IdentityId, parent_groups: &[IdentityId]) {
        for group in parent_groups {
            self.remove_membership(Membership::user(*group, user_id));
        }
        self.recompute_flattened();
    }

    /// Remove a user from every group and drop its entries
    pub fn delete_user(&mut self, user_id: IdentityId) {
        self.detach_user(user_id);
        self.remove_entries_of_identities(&[user_id]);
        self.recompute_flattened();
    }

    /// Remove a group, its edges in both directions and its entries.
    ///
    /// Member groups survive as detached groups; users keep only the
    /// memberships reachable without the deleted group.
    pub fn delete_group(&mut self, group_id: IdentityId) {
        self.detach_group(group_id);
        self.remove_entries_of_identities(&[group_id]);
        self.recompute_flattened();
    }

    /// Delete users and groups in one step
    pub fn delete_identities(&mut self, identities: &[IdentityId]) {
        for id in identities {
            if self.groups.contains_key(id) {
                self.detach_group(*id);
            } else {
                self.detach_user(*id);
            }
        }
        self.remove_entries_of_identities(identities);
        self.recompute_flattened();
    }

    fn detach_user(&mut self, user_id: IdentityId) {
        if let Some(parents) = self.user_groups.remove(&user_id) {
            for group_id in parents {
                if let Some(group) = self.groups.get_mut(&group_id) {
                    group.user_member_ids.remove(&user_id);
                }
            }
        }
    }

    fn detach_group(&mut self, group_id: IdentityId) {
        let Some(group) = self.groups.remove(&group_id) else {
            return;
        };
        for parent_id in &group.parent_group_ids {
            if let Some(parent) = self.groups.get_mut(parent_id) {
                parent.group_member_ids.remove(&group_id);
            }
        }
        for member_id in &group.group_member_ids {
            if let Some(member) = self.groups.get_mut(member_id) {
                member.parent_group_ids.remove(&group_id);
            }
        }
        for user_id in &group.user_member_ids {
            if let Some(parents) = self.user_groups.get_mut(user_id) {
                parents.remove(&group_id);
                if parents.is_empty() {
                    self.user_groups.remove(user_id);
                }
            }
        }
    }

    /// All groups reachable upward from the given direct groups
    fn ancestor_groups(&self, direct: impl IntoIterator<Item = IdentityId>) -> BTreeSet<IdentityId> {
        let mut result = BTreeSet::new();
        let mut queue: VecDeque<IdentityId> = direct.into_iter().collect();
        while let Some(group_id) = queue.pop_front() {
            if !result.insert(group_id) {
                continue;
            }
            if let Some(group) = self.groups.get(&group_id) {
                queue.extend(group.parent_group_ids.iter().copied());
            }
        }
        result
    }

    /// Rebuild the user-to-all-groups closure
    pub(crate) fn recompute_flattened(&mut self) {
        let flattened = self
            .user_groups
            .iter()
            .map(|(user, direct)| (*user, self.ancestor_groups(direct.iter().copied())))
            .filter(|(_, groups)| !groups.is_empty())
            .collect();
        self.flattened = flattened;
    }

    /// The identity itself plus every group it belongs to, transitively
    pub fn identities_of(&self, identity_id: IdentityId) -> BTreeSet<IdentityId> {
        let mut identities = match self.groups.get(&identity_id) {
            Some(group) => self.ancestor_groups(group.parent_group_ids.iter().copied()),
            None => self.flattened.get(&identity_id).cloned().unwrap_or_default(),
        };
        identities.insert(identity_id);
        identities
    }

    /// Whether `member_id` belongs to `group_id` directly or transitively
    pub fn is_in_group(&self, member_id: IdentityId, group_id: IdentityId) -> bool {
        member_id != group_id && self.identities_of(member_id).contains(&group_id)
    }

    /// Parent groups of a user or group, direct only or transitive
    pub fn get_parent_groups(&self, identity_id: IdentityId, direct_only: bool) -> Vec<IdentityId> {
        let direct: BTreeSet<IdentityId> = match self.groups.get(&identity_id) {
            Some(group) => group.parent_group_ids.clone(),
            None => self.user_groups.get(&identity_id).cloned().unwrap_or_default(),
        };
        if direct_only {
            return direct.into_iter().collect();
        }
        let mut all = self.ancestor_groups(direct);
        all.remove(&identity_id);
        all.into_iter().collect()
    }

    /// Every user inside the group, including users of nested groups
    pub fn users_in_group(&self, group_id: IdentityId) -> BTreeSet<IdentityId> {
        self.flattened
            .iter()
            .filter(|(_, groups)| groups.contains(&group_id))
            .map(|(user, _)| *user)
            .collect()
    }

    /// Flattened memberships as `user:group,group;user:group`, sorted.
    /// Stable text form used to compare membership states.
    pub fn membership_dump(&self) -> String {
        let mut users: Vec<_> = self.flattened.iter().collect();
        users.sort_by_key(|(user, _)| **user);
        users
            .into_iter()
            .map(|(user, groups)| {
                let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
                format!("{}:{}", user, groups.join(","))
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}
