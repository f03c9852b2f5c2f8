//! Structural activities: create, delete, modify owner and move.

use super::ActivityKind;
use crate::cache::CacheState;
use crate::data::SecurityDataProvider;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{EntityId, StoredSecurityEntity};
use log::{debug, info};
use std::collections::BTreeSet;

fn with_ancestors(state: &CacheState, entity_id: EntityId, ids: &mut BTreeSet<EntityId>) {
    ids.insert(entity_id);
    ids.extend(state.ancestors(entity_id));
}

pub(crate) fn affected_ids(state: &CacheState, kind: &ActivityKind) -> BTreeSet<EntityId> {
    let mut ids = BTreeSet::new();
    match kind {
        ActivityKind::CreateEntity {
            entity_id,
            parent_id,
            ..
        } => {
            ids.insert(*entity_id);
            if *parent_id != 0 {
                with_ancestors(state, *parent_id, &mut ids);
            }
        }
        ActivityKind::DeleteEntity { entity_id } => {
            with_ancestors(state, *entity_id, &mut ids);
            ids.extend(state.descendants(*entity_id));
        }
        ActivityKind::ModifyOwner { entity_id, .. } => with_ancestors(state, *entity_id, &mut ids),
        ActivityKind::MoveEntity {
            source_id,
            target_id,
        } => {
            with_ancestors(state, *source_id, &mut ids);
            ids.extend(state.descendants(*source_id));
            with_ancestors(state, *target_id, &mut ids);
        }
        _ => {}
    }
    ids
}

pub(crate) fn apply(kind: &ActivityKind, state: &mut CacheState) -> SecurityResult<()> {
    match kind {
        ActivityKind::CreateEntity {
            entity_id,
            parent_id,
            owner_id,
        } => state.create_entity(*entity_id, *parent_id, *owner_id),
        ActivityKind::DeleteEntity { entity_id } => {
            let removed = state.delete_entity(*entity_id);
            debug!("Removed {} entities with {}", removed.len(), entity_id);
            Ok(())
        }
        ActivityKind::ModifyOwner {
            entity_id,
            owner_id,
        } => state.modify_owner(*entity_id, *owner_id),
        ActivityKind::MoveEntity {
            source_id,
            target_id,
        } => state.move_entity(*source_id, *target_id),
        other => Err(SecurityError::Internal(format!(
            "{} is not a structural activity",
            other.name()
        ))),
    }
}

pub(crate) async fn store(kind: &ActivityKind, data: &dyn SecurityDataProvider) -> SecurityResult<()> {
    match kind {
        ActivityKind::CreateEntity {
            entity_id,
            parent_id,
            owner_id,
        } => {
            data.write_entity(&StoredSecurityEntity::new(*entity_id, *parent_id, *owner_id))
                .await
        }
        ActivityKind::DeleteEntity { entity_id } => {
            let removed = data.delete_entity_tree(*entity_id).await?;
            info!("🗑️ Deleted {} stored entities under {}", removed.len(), entity_id);
            Ok(())
        }
        ActivityKind::ModifyOwner {
            entity_id,
            owner_id,
        } => {
            update_row(data, *entity_id, |row| row.owner_id = *owner_id).await
        }
        ActivityKind::MoveEntity {
            source_id,
            target_id,
        } => {
            update_row(data, *source_id, |row| row.parent_id = *target_id).await
        }
        other => Err(SecurityError::Internal(format!(
            "{} is not a structural activity",
            other.name()
        ))),
    }
}

/// Load, change and write back one entity row. Entities the store does
/// not know are left alone.
pub(crate) async fn update_row<F>(
    data: &dyn SecurityDataProvider,
    entity_id: EntityId,
    change: F,
) -> SecurityResult<()>
where
    F: FnOnce(&mut StoredSecurityEntity) + Send,
{
    match data.load_stored_entity(entity_id).await? {
        Some(mut row) => {
            change(&mut row);
            data.write_entity(&row).await
        }
        None => {
            debug!("No stored row for entity {}, nothing to update", entity_id);
            Ok(())
        }
    }
}
