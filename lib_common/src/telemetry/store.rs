//! Typed persistence of the snapshot map on top of [`LocalStorage`].
//!
//! Two sibling keys are used: one holds the whole address -> snapshot map as a
//! JSON object, the other the timestamp of the last merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::storage::{LocalStorage, StoreError};
use crate::telemetry::model::DeviceSnapshot;

/// Key holding the serialized snapshot map.
pub const SNAPSHOTS_KEY: &str = "miner_snapshots";
/// Key holding the last-merge timestamp.
pub const UPDATED_AT_KEY: &str = "miner_snapshots_updated_at";

/// Normalized address -> snapshot.
pub type SnapshotMap = BTreeMap<String, DeviceSnapshot>;

/// What a previous run left behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    /// Snapshot map as last saved.
    pub snapshots: SnapshotMap,
    /// Timestamp of the last merge or liveness bump.
    pub updated_at: Option<String>,
}

/// Reads and writes the reconciler's state through a storage backend.
#[derive(Clone)]
pub struct SnapshotStore {
    storage: Arc<dyn LocalStorage>,
}

impl SnapshotStore {
    /// Wraps a storage backend.
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    /// Loads the persisted state. Missing keys yield an empty state.
    pub fn load(&self) -> Result<PersistedState, StoreError> {
        let snapshots = match self.storage.get_item(SNAPSHOTS_KEY)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Serde {
                key: SNAPSHOTS_KEY.to_string(),
                source,
            })?,
            None => SnapshotMap::new(),
        };
        let updated_at = self.storage.get_item(UPDATED_AT_KEY)?;
        Ok(PersistedState { snapshots, updated_at })
    }

    /// Persists the full map together with its timestamp.
    pub fn save(&self, snapshots: &SnapshotMap, updated_at: &str) -> Result<(), StoreError> {
        let raw = serde_json::to_string(snapshots).map_err(|source| StoreError::Serde {
            key: SNAPSHOTS_KEY.to_string(),
            source,
        })?;
        self.storage.set_item(SNAPSHOTS_KEY, &raw)?;
        self.save_updated_at(updated_at)
    }

    /// Persists only the timestamp.
    pub fn save_updated_at(&self, updated_at: &str) -> Result<(), StoreError> {
        self.storage.set_item(UPDATED_AT_KEY, updated_at)
    }

    /// Removes both keys.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.storage.remove_item(SNAPSHOTS_KEY)?;
        self.storage.remove_item(UPDATED_AT_KEY)
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}
