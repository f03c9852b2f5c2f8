//! Permission evaluation through a running node

mod common;

use common::{create_tree, single_node, start_single, test_config};
use entity_security::{
    EntryType, EntryTypeSet, MemoryDataProvider, PermissionBits, PermissionLevel,
    PermissionType, PermissionValue,
};
use std::collections::BTreeSet;
use std::sync::Arc;

const U1: i32 = 101;
const U2: i32 = 102;

fn bit(index: u8) -> PermissionBits {
    PermissionBits::from_index(index)
}

#[tokio::test]
async fn test_normal_and_sharing_chains_merge_independently() {
    let (system, _data) = single_node().await;
    create_tree(&system, &[(1, 0, 1), (2, 1, 1), (5, 2, 1), (14, 5, 1)]).await;

    let mut normal = system.create_acl_editor(EntryType::Normal).unwrap();
    normal.set(2, U1, false, bit(3), PermissionBits::EMPTY).unwrap();
    normal.apply().await.unwrap();
    let mut sharing = system.create_acl_editor(EntryType::Sharing).unwrap();
    sharing.set(2, U1, false, bit(12), PermissionBits::EMPTY).unwrap();
    sharing.apply().await.unwrap();

    let preview = PermissionType::PREVIEW_WITHOUT_REDACTION;
    let recall = PermissionType::RECALL_OLD_VERSION;
    assert_eq!(
        system
            .evaluate(U1, 14, preview, EntryTypeSet::of(&[EntryType::Normal]))
            .unwrap(),
        PermissionValue::Allowed
    );
    assert_eq!(
        system.evaluate(U1, 14, recall, EntryTypeSet::all()).unwrap(),
        PermissionValue::Allowed
    );
    assert_eq!(
        system
            .evaluate(U1, 14, recall, EntryTypeSet::of(&[EntryType::Normal]))
            .unwrap(),
        PermissionValue::Undefined
    );

    let effective = system.get_effective_entries(14, Some(U1)).unwrap();
    assert_eq!(effective.len(), 1);
    assert_eq!(effective[0].entry_type, EntryType::Normal);
    assert_eq!(effective[0].allow_bits, bit(3) | bit(12));

    let explicit = system.get_explicit_entries(2, EntryTypeSet::all()).unwrap();
    assert_eq!(explicit.len(), 2);
    assert!(system.get_explicit_entries(14, EntryTypeSet::all()).unwrap().is_empty());

    let mut breaker = system.create_acl_editor(EntryType::Normal).unwrap();
    breaker.break_inheritance(5, EntryTypeSet::empty()).unwrap();
    breaker.apply().await.unwrap();

    assert_eq!(
        system.evaluate(U1, 14, preview, EntryTypeSet::all()).unwrap(),
        PermissionValue::Undefined
    );
    assert_eq!(
        system.evaluate(U1, 14, recall, EntryTypeSet::all()).unwrap(),
        PermissionValue::Undefined
    );
    assert_eq!(system.get_first_acl_holder(14).unwrap(), Some(5));
    assert!(system.has_permission(U1, 2, &[preview]).unwrap());
    assert!(!system.has_subtree_permission(U1, 2, &[preview]).unwrap());

    let mut unbreaker = system.create_acl_editor(EntryType::Normal).unwrap();
    unbreaker.unbreak_inheritance(5, EntryTypeSet::empty()).unwrap();
    unbreaker.apply().await.unwrap();
    assert_eq!(
        system.evaluate(U1, 14, preview, EntryTypeSet::all()).unwrap(),
        PermissionValue::Allowed
    );
    assert_eq!(system.get_first_acl_holder(14).unwrap(), Some(2));
}

#[tokio::test]
async fn test_nearest_level_wins_and_deny_beats_allow_within_a_level() {
    let (system, _data) = single_node().await;
    create_tree(&system, &[(1, 0, 1), (2, 1, 1), (3, 2, 1)]).await;
    system.add_members_to_group(50, &[U1], &[], &[]).await.unwrap();

    let mut editor = system.create_acl_editor(EntryType::Normal).unwrap();
    editor.deny(1, U1, false, &[PermissionType::SEE]).unwrap();
    editor.allow(2, U1, false, &[PermissionType::SEE]).unwrap();
    editor.allow(3, U1, false, &[PermissionType::PREVIEW]).unwrap();
    editor.deny(3, 50, false, &[PermissionType::PREVIEW]).unwrap();
    editor.apply().await.unwrap();

    assert_eq!(
        system.get_permission(U1, 1, &[PermissionType::SEE]).unwrap(),
        PermissionValue::Denied
    );
    assert_eq!(
        system.get_permission(U1, 2, &[PermissionType::SEE]).unwrap(),
        PermissionValue::Allowed
    );
    assert_eq!(
        system.get_permission(U1, 3, &[PermissionType::PREVIEW]).unwrap(),
        PermissionValue::Denied
    );
    // allowing Preview also allowed See, and the group deny leaves See alone
    assert_eq!(
        system.get_permission(U1, 3, &[PermissionType::SEE]).unwrap(),
        PermissionValue::Allowed
    );
}

#[tokio::test]
async fn test_local_only_entries_do_not_inherit() {
    let (system, _data) = single_node().await;
    create_tree(&system, &[(1, 0, 1), (2, 1, 1)]).await;

    let mut editor = system.create_acl_editor(EntryType::Normal).unwrap();
    editor.allow(1, U1, true, &[PermissionType::SEE]).unwrap();
    editor.apply().await.unwrap();

    assert!(system.has_permission(U1, 1, &[PermissionType::SEE]).unwrap());
    assert!(!system.has_permission(U1, 2, &[PermissionType::SEE]).unwrap());
    assert!(system.get_effective_entries(2, None).unwrap().is_empty());
}

#[tokio::test]
async fn test_owner_and_everyone_groups() {
    let config = test_config().with_owner_group(900).with_everyone_group(901);
    let system = start_single(config, Arc::new(MemoryDataProvider::new())).await;
    create_tree(&system, &[(1, 0, 1), (2, 1, U1)]).await;

    let mut editor = system.create_acl_editor(EntryType::Normal).unwrap();
    editor.allow(1, 900, false, &[PermissionType::SAVE]).unwrap();
    editor.allow(1, 901, false, &[PermissionType::SEE]).unwrap();
    editor.apply().await.unwrap();

    assert!(system.has_permission(U1, 2, &[PermissionType::SAVE]).unwrap());
    assert!(!system.has_permission(U2, 2, &[PermissionType::SAVE]).unwrap());
    assert!(system.has_permission(U2, 2, &[PermissionType::SEE]).unwrap());
    assert_eq!(
        system.get_allowed_users(2, &[PermissionType::SAVE]).unwrap(),
        vec![U1]
    );
}

#[tokio::test]
async fn test_related_queries() {
    let (system, _data) = single_node().await;
    create_tree(&system, &[(1, 0, 1), (2, 1, 1), (3, 1, 1), (4, 2, 1)]).await;
    system.add_members_to_group(50, &[U2], &[], &[]).await.unwrap();

    let mut editor = system.create_acl_editor(EntryType::Normal).unwrap();
    editor.allow(2, U1, false, &[PermissionType::SEE]).unwrap();
    editor.allow(4, 50, false, &[PermissionType::SEE]).unwrap();
    editor.deny(3, U2, false, &[PermissionType::SEE]).unwrap();
    editor.apply().await.unwrap();

    let see = [PermissionType::SEE];
    assert_eq!(
        system
            .get_related_identities(1, PermissionLevel::Allowed, &see)
            .unwrap(),
        BTreeSet::from([U1, 50])
    );
    assert_eq!(
        system
            .get_related_identities(1, PermissionLevel::Denied, &see)
            .unwrap(),
        BTreeSet::from([U2])
    );
    assert_eq!(
        system
            .get_related_entities(1, PermissionLevel::Allowed, false, U2, &see)
            .unwrap(),
        BTreeSet::from([4])
    );
    assert!(system
        .get_related_entities(1, PermissionLevel::Allowed, true, U2, &see)
        .unwrap()
        .is_empty());
    assert_eq!(
        system
            .get_related_entities_one_level(1, PermissionLevel::Allowed, U1, &see)
            .unwrap(),
        vec![2]
    );
    assert_eq!(system.get_parent_groups(U2, true).unwrap(), vec![50]);
    assert!(system.is_in_group(U2, 50).unwrap());

    let counts = system
        .get_related_permissions(1, PermissionLevel::AllowedOrDenied, true, None)
        .unwrap();
    assert_eq!(counts.get(&0), Some(&3));
}

#[tokio::test]
async fn test_queries_reject_unknown_entities() {
    let (system, _data) = single_node().await;
    assert!(system
        .has_permission(U1, 77, &[PermissionType::SEE])
        .is_err());
    assert!(system.get_entity(77).unwrap().is_none());
}
