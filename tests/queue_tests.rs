//! Activity ordering, duplicates and gap handling

mod common;

use common::{bus_node, create_tree, single_node, start_single, test_config, wait_for_activity, wait_until};
use entity_security::model::StoredSecurityEntity;
use entity_security::queue::ExecutionState;
use entity_security::{
    ActivityKind, CacheState, CompletionState, EntryType, InProcessMessageBus,
    MemoryDataProvider, Message, MessageProvider, PermissionType, SecurityActivity,
    SecurityDataProvider,
};
use std::sync::Arc;
use std::time::Duration;

fn create(entity_id: i32, parent_id: i32) -> SecurityActivity {
    SecurityActivity::new(ActivityKind::CreateEntity {
        entity_id,
        parent_id,
        owner_id: 1,
    })
}

/// Save `activity` the way its originating node would
async fn saved(data: &MemoryDataProvider, activity: SecurityActivity) -> SecurityActivity {
    let mut activity = activity.with_sender("feeder");
    activity.id = data.save_activity(&activity).await.unwrap();
    activity
}

#[tokio::test]
async fn test_reversed_arrival_executes_in_dependency_order() {
    let bus = InProcessMessageBus::new();
    let data = Arc::new(MemoryDataProvider::new());
    let node = bus_node(&bus, "node", data.clone()).await;
    let feeder = bus.connect("feeder").await;
    create_tree(&node, &[(53, 0, 1)]).await;

    let create_54 = saved(&data, create(54, 53)).await;
    let create_55 = saved(&data, create(55, 54)).await;
    feeder.send(Message::Activity(create_55.clone())).await.unwrap();
    feeder.send(Message::Activity(create_54.clone())).await.unwrap();
    assert!(wait_for_activity(&node, create_55.id).await);

    assert_eq!(node.get_entity(55).unwrap().unwrap().parent_id, Some(54));
    assert_eq!(node.get_entity(54).unwrap().unwrap().parent_id, Some(53));

    let history = node.activity_history().unwrap();
    let released = |id: i32| {
        history
            .iter()
            .find(|e| e.activity_id == id && e.state == ExecutionState::Released)
            .cloned()
            .unwrap()
    };
    let first = released(create_54.id);
    let second = released(create_55.id);
    assert_eq!(second.waited_for, vec![create_54.id]);
    assert!(first.finished_at.unwrap() <= second.started_at.unwrap());
    assert!(wait_until(|| node.queue_snapshot().unwrap().ignored_duplicates == 1).await);
}

#[tokio::test]
async fn test_redelivered_activity_never_executes_twice() {
    let bus = InProcessMessageBus::new();
    let data = Arc::new(MemoryDataProvider::new());
    let node = bus_node(&bus, "node", data.clone()).await;
    let feeder = bus.connect("feeder").await;
    create_tree(&node, &[(1, 0, 1)]).await;

    let child = saved(&data, create(2, 1)).await;
    feeder.send(Message::Activity(child.clone())).await.unwrap();
    feeder.send(Message::Activity(child.clone())).await.unwrap();
    assert!(wait_for_activity(&node, child.id).await);
    assert!(wait_until(|| node.queue_snapshot().unwrap().ignored_duplicates == 1).await);

    // same id, different payload: still the already executed activity
    let mut impostor = SecurityActivity::new(ActivityKind::ModifyOwner {
        entity_id: 1,
        owner_id: 99,
    });
    impostor.id = child.id;
    feeder.send(Message::Activity(impostor)).await.unwrap();
    assert!(wait_until(|| node.queue_snapshot().unwrap().ignored_duplicates == 2).await);
    assert_eq!(node.get_entity(1).unwrap().unwrap().owner_id, 1);
    assert_eq!(
        node.completion_state().unwrap(),
        CompletionState::new(child.id, Vec::new())
    );
}

#[tokio::test]
async fn test_health_check_gives_up_lost_activities() {
    let data = Arc::new(MemoryDataProvider::new());
    let config = test_config().with_gap_retention(Duration::ZERO);
    let node = start_single(config, data.clone()).await;
    create_tree(&node, &[(1, 0, 1)]).await;

    let lost = saved(&data, create(2, 1)).await;
    assert!(data.delete_activity(lost.id).await.unwrap());
    let third = node.create_entity(3, 1, 1).await.unwrap();
    assert_eq!(
        node.completion_state().unwrap(),
        CompletionState::new(third, vec![lost.id])
    );

    let report = node.health_check().await.unwrap();
    assert_eq!(report.lost_gaps, vec![lost.id]);
    assert!(report.open_gaps.is_empty());
    assert_eq!(
        node.completion_state().unwrap(),
        CompletionState::new(third, Vec::new())
    );
}

#[tokio::test]
async fn test_recent_gaps_stay_open() {
    let (node, data) = single_node().await;
    create_tree(&node, &[(1, 0, 1)]).await;

    let lost = saved(&data, create(2, 1)).await;
    data.delete_activity(lost.id).await.unwrap();
    node.create_entity(3, 1, 1).await.unwrap();

    let report = node.health_check().await.unwrap();
    assert!(report.lost_gaps.is_empty());
    assert_eq!(report.open_gaps, vec![lost.id]);
}

#[tokio::test]
async fn test_health_check_runs_saved_but_undelivered_activities() {
    let (node, data) = single_node().await;
    create_tree(&node, &[(1, 0, 1)]).await;

    let undelivered = saved(&data, create(4, 1)).await;
    let report = node.health_check().await.unwrap();
    assert_eq!(report.loaded, 1);
    node.wait_idle().await;

    assert_eq!(node.get_entity(4).unwrap().unwrap().parent_id, Some(1));
    assert!(data.get_unprocessed_activity_ids().await.unwrap().is_empty());
    assert_eq!(
        node.completion_state().unwrap(),
        CompletionState::new(undelivered.id, Vec::new())
    );
}

#[tokio::test]
async fn test_startup_replays_unprocessed_activities() {
    let data = Arc::new(MemoryDataProvider::new());
    saved(&data, create(1, 0)).await;
    saved(&data, create(2, 1)).await;

    let node = start_single(test_config(), data.clone()).await;
    assert_eq!(node.get_entity(2).unwrap().unwrap().level, 1);
    assert_eq!(
        node.completion_state().unwrap(),
        CompletionState::new(2, Vec::new())
    );
    assert!(data.get_unprocessed_activity_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disjoint_activities_commute() {
    let base = [(1, 0, 1), (2, 1, 1), (10, 0, 1)];
    let (forward, _) = single_node().await;
    let (backward, _) = single_node().await;
    create_tree(&forward, &base).await;
    create_tree(&backward, &base).await;

    forward.create_entity(3, 2, 5).await.unwrap();
    forward.modify_owner(10, 7).await.unwrap();
    let mut editor = forward.create_acl_editor(EntryType::Normal).unwrap();
    editor.allow(10, 101, false, &[PermissionType::OPEN]).unwrap();
    editor.apply().await.unwrap();

    let mut editor = backward.create_acl_editor(EntryType::Normal).unwrap();
    editor.allow(10, 101, false, &[PermissionType::OPEN]).unwrap();
    editor.apply().await.unwrap();
    backward.modify_owner(10, 7).await.unwrap();
    backward.create_entity(3, 2, 5).await.unwrap();

    for id in [1, 2, 3, 10] {
        assert_eq!(forward.get_entity(id).unwrap(), backward.get_entity(id).unwrap());
    }
    assert_eq!(forward.get_acl(10).unwrap(), backward.get_acl(10).unwrap());
    assert_eq!(forward.get_acl(3).unwrap(), backward.get_acl(3).unwrap());
}

#[test]
fn test_membership_activities_conflict_with_everything() {
    let rows = [(1, 0), (2, 1), (9, 0)]
        .iter()
        .map(|(id, parent)| StoredSecurityEntity::new(*id, *parent, 1))
        .collect();
    let state = CacheState::build(rows, Vec::new(), Vec::new());

    let membership = SecurityActivity::new(ActivityKind::AddUserToSecurityGroups {
        user_id: 101,
        parent_groups: vec![50],
    });
    let other_membership = SecurityActivity::new(ActivityKind::DeleteGroup { group_id: 60 });
    let create_child = create(3, 2);
    let unrelated = SecurityActivity::new(ActivityKind::ModifyOwner {
        entity_id: 9,
        owner_id: 4,
    });

    for other in [&create_child, &unrelated, &other_membership] {
        assert!(membership.should_wait_for(other, &state));
        assert!(other.should_wait_for(&membership, &state));
    }
    assert!(!create_child.should_wait_for(&unrelated, &state));
    assert!(!unrelated.should_wait_for(&create_child, &state));
}

#[tokio::test]
async fn test_shuffled_independent_changes_reach_the_same_state() {
    use rand::seq::SliceRandom;

    let roots: Vec<(i32, i32, i32)> = (1..=8).map(|id| (id, 0, 1)).collect();
    let (ordered, _) = single_node().await;
    let (shuffled, _) = single_node().await;
    create_tree(&ordered, &roots).await;
    create_tree(&shuffled, &roots).await;

    let mut owners: Vec<(i32, i32)> = (1..=8).map(|id| (id, id + 100)).collect();
    for (entity_id, owner_id) in &owners {
        ordered.modify_owner(*entity_id, *owner_id).await.unwrap();
    }
    owners.shuffle(&mut rand::thread_rng());
    let pending: Vec<_> = owners
        .iter()
        .map(|(entity_id, owner_id)| shuffled.modify_owner(*entity_id, *owner_id))
        .collect();
    for result in futures::future::join_all(pending).await {
        result.unwrap();
    }

    for id in 1..=8 {
        assert_eq!(ordered.get_entity(id).unwrap(), shuffled.get_entity(id).unwrap());
    }
    assert!(shuffled.queue_snapshot().unwrap().executing.is_empty());
}
