//! # lib_common
//!
//! Shared library for the miner monitor. Every top-level module sits behind a
//! cargo feature of the same name; `full` (the default) turns them all on.

// Declare the modules to re-export
#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "storage")]
pub mod storage;
#[cfg(feature = "telemetry")]
pub mod telemetry;
#[cfg(feature = "utils")]
pub mod utils;

// Re-export the types most callers need
#[cfg(feature = "configs")]
pub use configs::feed_endpoint::{FeedEndpoint, SubdomainSetting};
#[cfg(feature = "core")]
pub use crate::core::backoff::{Backoff, ConnectionState};
#[cfg(feature = "ingestors")]
pub use ingestors::miner_feed::{FeedConfig, FeedError, FeedEvent, FeedStatus, FeedUpdate, MinerFeed, Subscription};
#[cfg(feature = "storage")]
pub use storage::{FileStorage, LocalStorage, MemoryStorage};
#[cfg(feature = "telemetry")]
pub use telemetry::{
    model::{DeviceSnapshot, FetchStatus, MinerData, UpdateBatch},
    reconciler::TelemetryReconciler,
    store::SnapshotStore,
};
