//! # Data Ingestors Module
//!
//! Clients that bring external data into the process.
//!
//! ## Contained Modules:
//! - **`miner_feed`**: the reconnecting WebSocket client for the live miner
//!   telemetry feed. It announces the tracked address list, filters batches
//!   to it, and feeds the reconciler and every registered consumer.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The WebSocket client for the live miner telemetry feed.
pub mod miner_feed;

// --- Public API Re-exports ---
pub use miner_feed::{
    FeedConfig, FeedError, FeedEvent, FeedSession, FeedStatus, FeedUpdate, HandleOutcome, MinerFeed, Subscription,
};
