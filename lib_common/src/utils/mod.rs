//! # Utilities Module
//!
//! Small helpers shared by the telemetry, configuration and feed modules.
//!
//! ## Contained Modules:
//!
//! - **`address`**: normalization of device network addresses, the key every
//!   snapshot is stored under.
//! - **`clock`**: RFC 3339 timestamps for snapshots and persisted state.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Device address normalization.
pub mod address;
/// Timestamp helpers.
pub mod clock;

pub use address::{fallback_address, normalize_address};
pub use clock::now_rfc3339;
