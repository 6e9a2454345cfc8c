//! # Configuration Modules
//!
//! Resolution of where the live feed lives.

/// Derives the feed socket URL and API origin from the user's tunnel subdomain.
pub mod feed_endpoint;

pub use feed_endpoint::{ConfigError, FeedEndpoint, SubdomainSetting};
