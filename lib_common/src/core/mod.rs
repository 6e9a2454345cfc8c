//! # Core Engine Module
//!
//! The pieces of the feed client that do not touch the network.
//!
//! ## Core Components:
//!
//! - **`backoff`**: the reconnect delay policy and the
//!   Disconnected / Connecting / Connected / Backoff state machine that drives
//!   the connection task.
//!
//! - **`dispatcher`**: the registry of feed consumers. It computes the tracked
//!   address list and fans decoded updates out to every consumer.
//!
//! - **`address_gate`**: remembers which address list was last announced to
//!   the backend so the same list is never sent twice in a row.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Remembers the last announced address list.
pub mod address_gate;
/// Reconnect delay policy and connection state machine.
pub mod backoff;
/// Registry of feed consumers.
pub mod dispatcher;

// --- Public API Re-exports ---
pub use address_gate::AddressGate;
pub use backoff::{Backoff, ConnectionState, LinkMachine};
pub use dispatcher::{Dispatcher, Listener, ListenerId, Removal};
