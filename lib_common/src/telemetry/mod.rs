//! # Telemetry Module
//!
//! Everything about the per-device state the monitor keeps, independent of how
//! it arrives.
//!
//! ## Contained Modules:
//! - **`model`**: the typed feed schema (`UpdateBatch`, `BatchEntry`,
//!   `MinerData`) and the stored `DeviceSnapshot`.
//! - **`reconciler`**: folds batches into the address -> snapshot map.
//! - **`store`**: persists that map to durable local storage.
//! - **`layout`**: locations / panels / slots, the tracked address list and
//!   fleet summaries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Site layout and fleet aggregates.
pub mod layout;
/// Feed schema and device snapshots.
pub mod model;
/// The snapshot map and its merge rules.
pub mod reconciler;
/// Persistence of the snapshot map.
pub mod store;

pub use layout::{FleetSummary, Location, Panel, SiteLayout};
pub use model::{BatchEntry, DeviceSnapshot, FetchStatus, MinerData, ParsedMessage, UpdateBatch};
pub use reconciler::TelemetryReconciler;
pub use store::{SnapshotMap, SnapshotStore};
