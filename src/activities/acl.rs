//! The SetAcl activity: explicit entries, breaks and undo-breaks in one step.

use super::entity::update_row;
use super::ActivityKind;
use crate::cache::CacheState;
use crate::data::SecurityDataProvider;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{require_id, AclInfo, EntityId, EntryTypeSet, StoredAce};
use std::collections::BTreeSet;

pub(crate) fn validate(kind: &ActivityKind) -> SecurityResult<()> {
    let ActivityKind::SetAcl {
        acls,
        breaks,
        undo_breaks,
    } = kind
    else {
        return Err(SecurityError::Internal(format!("{} is not SetAcl", kind.name())));
    };
    for id in named_entities(acls, breaks, undo_breaks) {
        require_id(id, "entity id")?;
    }
    for acl in acls {
        for ace in &acl.entries {
            require_id(ace.identity_id, "identity id")?;
        }
    }
    Ok(())
}

/// Every entity id named by the ACL list, the breaks and the undo-breaks
pub(crate) fn named_entities(
    acls: &[AclInfo],
    breaks: &[(EntityId, EntryTypeSet)],
    undo_breaks: &[(EntityId, EntryTypeSet)],
) -> BTreeSet<EntityId> {
    acls.iter()
        .map(|acl| acl.entity_id)
        .chain(breaks.iter().map(|(id, _)| *id))
        .chain(undo_breaks.iter().map(|(id, _)| *id))
        .collect()
}

pub(crate) fn affected_ids(
    state: &CacheState,
    acls: &[AclInfo],
    breaks: &[(EntityId, EntryTypeSet)],
    undo_breaks: &[(EntityId, EntryTypeSet)],
) -> BTreeSet<EntityId> {
    let mut ids = BTreeSet::new();
    for entity_id in named_entities(acls, breaks, undo_breaks) {
        ids.insert(entity_id);
        ids.extend(state.ancestors(entity_id));
        ids.extend(state.descendants(entity_id));
    }
    ids
}

pub(crate) async fn store(kind: &ActivityKind, data: &dyn SecurityDataProvider) -> SecurityResult<()> {
    let ActivityKind::SetAcl {
        acls,
        breaks,
        undo_breaks,
    } = kind
    else {
        return Err(SecurityError::Internal(format!("{} is not SetAcl", kind.name())));
    };
    for (entity_id, types) in breaks {
        let types = expand(*types);
        update_row(data, *entity_id, |row| {
            for entry_type in types.iter() {
                row.inheritance_breaks.insert(entry_type);
            }
        })
        .await?;
    }
    for (entity_id, types) in undo_breaks {
        let types = expand(*types);
        update_row(data, *entity_id, |row| {
            for entry_type in types.iter() {
                row.inheritance_breaks.remove(entry_type);
            }
        })
        .await?;
    }

    let (cleared, written): (Vec<StoredAce>, Vec<StoredAce>) = acls
        .iter()
        .flat_map(|acl| acl.entries.iter().map(|ace| StoredAce::new(acl.entity_id, ace)))
        .partition(|row| row.allow_bits.is_empty() && row.deny_bits.is_empty());
    if !cleared.is_empty() {
        data.remove_aces(&cleared).await?;
    }
    if !written.is_empty() {
        data.write_aces(&written).await?;
    }
    Ok(())
}

fn expand(types: EntryTypeSet) -> EntryTypeSet {
    if types.is_empty() {
        EntryTypeSet::all()
    } else {
        types
    }
}
