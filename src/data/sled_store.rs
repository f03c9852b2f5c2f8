//! Sled-backed data provider.
//!
//! One tree per table. Activity and entity keys are big-endian ids so tree
//! order is id order; entry and membership keys are their serialized
//! uniqueness keys. Values are JSON.

use super::{cleanup_limit, completion_from_flags, subtree_of, ActivityRecord, SecurityDataProvider};
use crate::activities::SecurityActivity;
use crate::error::{SecurityError, SecurityResult};
use crate::model::{
    ActivityId, EntityId, IdentityId, Membership, StoredAce, StoredSecurityEntity,
};
use crate::queue::CompletionState;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::path::Path;

const LAST_ACTIVITY_ID: &[u8] = b"last_activity_id";
const CLEANED_UP_TO: &[u8] = b"cleaned_up_to";

#[derive(Clone)]
pub struct SledDataProvider {
    db: sled::Db,
    meta_tree: sled::Tree,
    activities_tree: sled::Tree,
    entities_tree: sled::Tree,
    aces_tree: sled::Tree,
    memberships_tree: sled::Tree,
}

fn id_key(id: i32) -> [u8; 4] {
    id.to_be_bytes()
}

fn decode_id(bytes: &[u8]) -> SecurityResult<i32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| SecurityError::Database(format!("Malformed id of {} bytes", bytes.len())))?;
    Ok(i32::from_be_bytes(raw))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SecurityResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn ace_key(ace: &StoredAce) -> SecurityResult<Vec<u8>> {
    Ok(serde_json::to_vec(&(ace.entity_id, ace.key()))?)
}

impl SledDataProvider {
    /// Wrap an open database, creating the trees on first use
    pub fn new(db: sled::Db) -> SecurityResult<Self> {
        Ok(Self {
            meta_tree: db.open_tree("security_meta")?,
            activities_tree: db.open_tree("security_activities")?,
            entities_tree: db.open_tree("security_entities")?,
            aces_tree: db.open_tree("security_aces")?,
            memberships_tree: db.open_tree("security_memberships")?,
            db,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> SecurityResult<Self> {
        let path = path.as_ref();
        info!("🗄️ Opening security store at {}", path.display());
        Self::new(sled::open(path)?)
    }

    /// A store that disappears when dropped
    pub fn temporary() -> SecurityResult<Self> {
        Self::new(sled::Config::new().temporary(true).open()?)
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    fn put<T: Serialize>(&self, tree: &sled::Tree, key: &[u8], item: &T) -> SecurityResult<()> {
        tree.insert(key, serde_json::to_vec(item)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, tree: &sled::Tree, key: &[u8]) -> SecurityResult<Option<T>> {
        tree.get(key)?.map(|bytes| decode(&bytes)).transpose()
    }

    fn values<T: DeserializeOwned>(&self, tree: &sled::Tree) -> SecurityResult<Vec<T>> {
        tree.iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                decode(&bytes)
            })
            .collect()
    }

    fn meta_id(&self, key: &[u8]) -> SecurityResult<ActivityId> {
        match self.meta_tree.get(key)? {
            Some(bytes) => decode_id(&bytes),
            None => Ok(0),
        }
    }

    fn records(&self) -> SecurityResult<Vec<ActivityRecord>> {
        self.values(&self.activities_tree)
    }

    fn flush(&self) -> SecurityResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl SecurityDataProvider for SledDataProvider {
    async fn install_database(&self) -> SecurityResult<()> {
        for tree in [
            &self.meta_tree,
            &self.activities_tree,
            &self.entities_tree,
            &self.aces_tree,
            &self.memberships_tree,
        ] {
            tree.clear()?;
        }
        self.flush()?;
        info!("🗄️ Installed empty security store");
        Ok(())
    }

    async fn save_activity(&self, activity: &SecurityActivity) -> SecurityResult<ActivityId> {
        let next = self.meta_tree.update_and_fetch(LAST_ACTIVITY_ID, |old| {
            let last = old
                .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
                .map(i32::from_be_bytes)
                .unwrap_or(0);
            Some(id_key(last + 1).to_vec())
        })?;
        let id = match next {
            Some(bytes) => decode_id(&bytes)?,
            None => {
                return Err(SecurityError::Database(
                    "activity id counter is missing".to_string(),
                ))
            }
        };
        let mut saved = activity.clone();
        saved.id = id;
        saved.from_receiver = false;
        saved.from_database = false;
        let record = ActivityRecord {
            id,
            activity: saved,
            saved_at: Utc::now(),
            unprocessed: true,
        };
        self.put(&self.activities_tree, &id_key(id), &record)?;
        self.flush()?;
        Ok(id)
    }

    async fn load_activities(
        &self,
        from_id: ActivityId,
        to_id: ActivityId,
        max_count: usize,
        only_unprocessed: bool,
    ) -> SecurityResult<Vec<SecurityActivity>> {
        if from_id > to_id {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for entry in self.activities_tree.range(id_key(from_id)..=id_key(to_id)) {
            if result.len() >= max_count {
                break;
            }
            let (_, bytes) = entry?;
            let record: ActivityRecord = decode(&bytes)?;
            if !only_unprocessed || record.unprocessed {
                result.push(record.activity);
            }
        }
        Ok(result)
    }

    async fn load_activity(&self, id: ActivityId) -> SecurityResult<Option<SecurityActivity>> {
        let record: Option<ActivityRecord> = self.get(&self.activities_tree, &id_key(id))?;
        Ok(record.map(|r| r.activity))
    }

    async fn mark_activity_processed(&self, id: ActivityId) -> SecurityResult<()> {
        if let Some(mut record) = self.get::<ActivityRecord>(&self.activities_tree, &id_key(id))? {
            if record.unprocessed {
                record.unprocessed = false;
                self.put(&self.activities_tree, &id_key(id), &record)?;
                self.flush()?;
            }
        }
        Ok(())
    }

    async fn delete_activity(&self, id: ActivityId) -> SecurityResult<bool> {
        let removed = self.activities_tree.remove(id_key(id))?.is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    async fn load_completion_state(&self) -> SecurityResult<(CompletionState, ActivityId)> {
        let flags: Vec<(ActivityId, bool)> = self
            .records()?
            .iter()
            .map(|r| (r.id, r.unprocessed))
            .collect();
        let (state, last_saved) = completion_from_flags(&flags, self.meta_id(CLEANED_UP_TO)?);
        Ok((state, last_saved.max(self.meta_id(LAST_ACTIVITY_ID)?)))
    }

    async fn get_unprocessed_activity_ids(&self) -> SecurityResult<Vec<ActivityId>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.unprocessed)
            .map(|r| r.id)
            .collect())
    }

    async fn get_last_activity_id(&self) -> SecurityResult<ActivityId> {
        self.meta_id(LAST_ACTIVITY_ID)
    }

    async fn cleanup_activities(&self, older_than_minutes: u64) -> SecurityResult<usize> {
        let Some(limit) = cleanup_limit(older_than_minutes) else {
            return Ok(0);
        };
        let expired: Vec<ActivityId> = self
            .records()?
            .into_iter()
            .filter(|r| !r.unprocessed && r.saved_at <= limit)
            .map(|r| r.id)
            .collect();
        for id in &expired {
            self.activities_tree.remove(id_key(*id))?;
        }
        if let Some(highest) = expired.last() {
            let floor = self.meta_id(CLEANED_UP_TO)?.max(*highest);
            self.meta_tree.insert(CLEANED_UP_TO, id_key(floor).to_vec())?;
            self.flush()?;
            debug!("Removed {} old activities up to {}", expired.len(), highest);
        }
        Ok(expired.len())
    }

    async fn load_stored_entity(&self, id: EntityId) -> SecurityResult<Option<StoredSecurityEntity>> {
        self.get(&self.entities_tree, &id_key(id))
    }

    async fn load_all_entities(&self) -> SecurityResult<Vec<StoredSecurityEntity>> {
        self.values(&self.entities_tree)
    }

    async fn write_entity(&self, entity: &StoredSecurityEntity) -> SecurityResult<()> {
        self.put(&self.entities_tree, &id_key(entity.id), entity)?;
        self.flush()
    }

    async fn delete_entity_tree(&self, id: EntityId) -> SecurityResult<Vec<EntityId>> {
        let rows: Vec<StoredSecurityEntity> = self.values(&self.entities_tree)?;
        if !rows.iter().any(|r| r.id == id) {
            return Ok(Vec::new());
        }
        let removed = subtree_of(&rows, id);
        let removed_set: HashSet<EntityId> = removed.iter().copied().collect();
        for entity_id in &removed {
            self.entities_tree.remove(id_key(*entity_id))?;
        }
        for ace in self.values::<StoredAce>(&self.aces_tree)? {
            if removed_set.contains(&ace.entity_id) {
                self.aces_tree.remove(ace_key(&ace)?)?;
            }
        }
        self.flush()?;
        Ok(removed)
    }

    async fn load_all_aces(&self) -> SecurityResult<Vec<StoredAce>> {
        let mut aces: Vec<StoredAce> = self.values(&self.aces_tree)?;
        aces.sort_by_key(|ace| (ace.entity_id, ace.key()));
        Ok(aces)
    }

    async fn write_aces(&self, aces: &[StoredAce]) -> SecurityResult<()> {
        for ace in aces {
            self.put(&self.aces_tree, &ace_key(ace)?, ace)?;
        }
        self.flush()
    }

    async fn remove_aces(&self, aces: &[StoredAce]) -> SecurityResult<()> {
        for ace in aces {
            self.aces_tree.remove(ace_key(ace)?)?;
        }
        self.flush()
    }

    async fn load_all_memberships(&self) -> SecurityResult<Vec<Membership>> {
        let mut memberships: Vec<Membership> = self.values(&self.memberships_tree)?;
        memberships.sort_unstable();
        Ok(memberships)
    }

    async fn add_memberships(&self, memberships: &[Membership]) -> SecurityResult<()> {
        for membership in memberships {
            self.put(&self.memberships_tree, &serde_json::to_vec(membership)?, membership)?;
        }
        self.flush()
    }

    async fn remove_memberships(&self, memberships: &[Membership]) -> SecurityResult<()> {
        for membership in memberships {
            self.memberships_tree.remove(serde_json::to_vec(membership)?)?;
        }
        self.flush()
    }

    async fn delete_identities(&self, identities: &[IdentityId]) -> SecurityResult<()> {
        let doomed: HashSet<IdentityId> = identities.iter().copied().collect();
        for membership in self.values::<Membership>(&self.memberships_tree)? {
            if doomed.contains(&membership.group_id) || doomed.contains(&membership.member_id) {
                self.memberships_tree.remove(serde_json::to_vec(&membership)?)?;
            }
        }
        for ace in self.values::<StoredAce>(&self.aces_tree)? {
            if doomed.contains(&ace.identity_id) {
                self.aces_tree.remove(ace_key(&ace)?)?;
            }
        }
        self.flush()
    }
}
