//! # Telemetry Reconciler
//!
//! Owns the canonical address -> snapshot map. Batches are folded into it in
//! arrival order; an address that is absent from a batch keeps its previous
//! snapshot, so skipped or reordered batches show up as stale data and never
//! as missing devices. The only way to drop entries is [`TelemetryReconciler::reset`].
//!
//! Every merge is followed by a write of the whole map to durable storage so
//! the next process start begins from the last known state.

use crate::storage::StoreError;
use crate::telemetry::model::{DeviceSnapshot, UpdateBatch};
use crate::telemetry::store::{SnapshotMap, SnapshotStore};
use crate::utils::normalize_address;

/// The address -> snapshot map and its persistence.
#[derive(Debug)]
pub struct TelemetryReconciler {
    store: SnapshotStore,
    snapshots: SnapshotMap,
    updated_at: Option<String>,
}

impl TelemetryReconciler {
    /// Seeds the map from whatever the store last persisted.
    ///
    /// An unreadable store is logged and treated as empty; the next merge
    /// overwrites it.
    pub fn open(store: SnapshotStore) -> Self {
        let state = match store.load() {
            Ok(state) => {
                log::info!("Loaded {} persisted miner snapshots.", state.snapshots.len());
                state
            }
            Err(e) => {
                log::warn!("Ignoring persisted miner snapshots: {}", e);
                Default::default()
            }
        };
        Self {
            store,
            snapshots: state.snapshots,
            updated_at: state.updated_at,
        }
    }

    /// Folds a batch into the map and persists the result.
    ///
    /// Each entry's address is normalized (an entry without one is stored
    /// under the empty key). Duplicates inside one batch resolve in iteration
    /// order, last one wins. Returns the number of entries applied.
    ///
    /// The in-memory map is updated even when persisting fails.
    pub fn merge(&mut self, batch: &UpdateBatch) -> Result<usize, StoreError> {
        let stamp = batch.stamp();
        for entry in &batch.entries {
            let address = normalize_address(entry.ip.as_deref().unwrap_or_default());
            let merged = DeviceSnapshot::merged(self.snapshots.get(&address), address.clone(), entry, &stamp);
            self.snapshots.insert(address, merged);
        }
        self.updated_at = Some(stamp.clone());
        self.store.save(&self.snapshots, &stamp)?;
        Ok(batch.entries.len())
    }

    /// Records feed liveness without touching any snapshot.
    pub fn touch(&mut self, stamp: &str) -> Result<(), StoreError> {
        self.updated_at = Some(stamp.to_string());
        self.store.save_updated_at(stamp)
    }

    /// Read-only view of the whole map.
    pub fn get_all(&self) -> &SnapshotMap {
        &self.snapshots
    }

    /// Looks up one device; the address is normalized first.
    pub fn get(&self, address: &str) -> Option<&DeviceSnapshot> {
        self.snapshots.get(&normalize_address(address))
    }

    /// Timestamp of the last merge or liveness bump.
    pub fn last_updated(&self) -> Option<&str> {
        self.updated_at.as_deref()
    }

    /// Number of devices known.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// True when no device has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Forgets every snapshot, in memory and on disk.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.snapshots.clear();
        self.updated_at = None;
        self.store.clear()
    }
}
