//! Group membership changes through a running node

mod common;

use common::{create_tree, single_node};
use entity_security::{EntryType, Membership, PermissionType, SecurityDataProvider};

/// G1 <- G2 <- G3 <- G4 and G3 <- G5 (parent <- member group).
/// User 101 is in G3, 102 in G4, 103 in G5 and G1, 104 in G2.
async fn build_groups(system: &entity_security::SecuritySystem) {
    system.add_members_to_group(1, &[103], &[2], &[]).await.unwrap();
    system.add_members_to_group(2, &[104], &[3], &[]).await.unwrap();
    system.add_members_to_group(3, &[101], &[4, 5], &[]).await.unwrap();
    system.add_members_to_group(4, &[102], &[], &[]).await.unwrap();
    system.add_members_to_group(5, &[103], &[], &[]).await.unwrap();
}

#[tokio::test]
async fn test_delete_group_strips_memberships() {
    let (system, data) = single_node().await;
    build_groups(&system).await;
    assert_eq!(
        system.membership_dump().unwrap(),
        "101:1,2,3;102:1,2,3,4;103:1,2,3,5;104:1,2"
    );

    system.delete_group(3).await.unwrap();
    assert_eq!(system.membership_dump().unwrap(), "102:4;103:1,5;104:1,2");

    let stored = data.load_all_memberships().await.unwrap();
    assert!(stored
        .iter()
        .all(|m| m.group_id != 3 && m.member_id != 3));
    assert!(stored.contains(&Membership::user(4, 102)));
}

#[tokio::test]
async fn test_membership_drives_evaluation() {
    let (system, _data) = single_node().await;
    create_tree(&system, &[(10, 0, 1), (11, 10, 1)]).await;
    build_groups(&system).await;

    let mut editor = system.create_acl_editor(EntryType::Normal).unwrap();
    editor.allow(10, 2, false, &[PermissionType::OPEN]).unwrap();
    editor.apply().await.unwrap();

    assert!(system.has_permission(102, 11, &[PermissionType::OPEN]).unwrap());
    assert_eq!(
        system.get_allowed_users(11, &[PermissionType::OPEN]).unwrap(),
        vec![101, 102, 103, 104]
    );

    system.remove_members_from_group(3, &[], &[4], &[]).await.unwrap();
    assert!(!system.has_permission(102, 11, &[PermissionType::OPEN]).unwrap());
    assert!(system.has_permission(101, 11, &[PermissionType::OPEN]).unwrap());
    assert_eq!(system.get_parent_groups(101, false).unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_user_membership_operations() {
    let (system, data) = single_node().await;
    system.add_user_to_groups(101, &[7, 8]).await.unwrap();
    assert!(system.is_in_group(101, 7).unwrap());
    assert_eq!(system.get_parent_groups(101, true).unwrap(), vec![7, 8]);

    system.remove_user_from_groups(101, &[7]).await.unwrap();
    assert!(!system.is_in_group(101, 7).unwrap());
    assert!(system.is_in_group(101, 8).unwrap());

    system.add_user_to_groups(102, &[8]).await.unwrap();
    system.delete_user(101).await.unwrap();
    assert_eq!(system.membership_dump().unwrap(), "102:8");

    system.delete_identities(&[8]).await.unwrap();
    assert_eq!(system.membership_dump().unwrap(), "");
    assert!(data.load_all_memberships().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_membership_activities_reject_default_ids() {
    let (system, _data) = single_node().await;
    assert!(system.add_user_to_groups(0, &[1]).await.is_err());
    assert!(system.delete_group(0).await.is_err());
}
