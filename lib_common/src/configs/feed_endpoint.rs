//! # Feed Endpoint
//!
//! The live feed is reached through a tunnel whose subdomain the user picks.
//! From that one value both endpoints are derived:
//!
//! - socket URL: `wss://{subdomain}.{base_domain}/ws`
//! - API origin: `https://{subdomain}.{base_domain}/`, where the tracked
//!   address list is announced (`POST /api/set-miner-ips`).
//!
//! The chosen subdomain is kept in durable local storage so it survives
//! restarts; until the user sets one, [`DEFAULT_SUBDOMAIN`] is used.

use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::storage::{LocalStorage, StoreError};

/// Subdomain used until the user configures one.
pub const DEFAULT_SUBDOMAIN: &str = "minerhub";
/// Tunnel provider domain the subdomain lives under.
pub const DEFAULT_BASE_DOMAIN: &str = "loca.lt";
/// Storage key of the persisted subdomain.
pub const SUBDOMAIN_KEY: &str = "feed_subdomain";
/// Path, relative to the API origin, of the address-list announcement.
pub const SET_MINER_IPS_PATH: &str = "api/set-miner-ips";

/// Errors raised while resolving the feed endpoint.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Subdomains are limited to `[a-z0-9-]`, 1..=63 chars, no leading or trailing `-`.
    #[error("Invalid subdomain '{0}'")]
    InvalidSubdomain(String),

    /// A URL override could not be parsed.
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        /// The rejected value.
        url: String,
        /// Underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// A URL override has the wrong scheme.
    #[error("URL '{url}' must use one of the schemes {expected:?}")]
    WrongScheme {
        /// The rejected value.
        url: String,
        /// Accepted schemes.
        expected: &'static [&'static str],
    },

    /// The subdomain setting could not be read or written.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Checks and normalizes (trim, lowercase) a subdomain.
pub fn validate_subdomain(subdomain: &str) -> Result<String, ConfigError> {
    let candidate = subdomain.trim().to_ascii_lowercase();
    let valid = (1..=63).contains(&candidate.len())
        && !candidate.starts_with('-')
        && !candidate.ends_with('-')
        && candidate
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(candidate)
    } else {
        Err(ConfigError::InvalidSubdomain(subdomain.to_string()))
    }
}

fn parse_with_scheme(raw: &str, expected: &'static [&'static str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    if !expected.contains(&url.scheme()) {
        return Err(ConfigError::WrongScheme {
            url: raw.to_string(),
            expected,
        });
    }
    Ok(url)
}

/// Where the feed and its control API live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEndpoint {
    /// WebSocket URL of the live feed.
    pub socket_url: Url,
    /// HTTP origin of the control API.
    pub api_origin: Url,
}

impl FeedEndpoint {
    /// Derives both endpoints from a tunnel subdomain.
    pub fn from_subdomain(subdomain: &str, base_domain: &str) -> Result<Self, ConfigError> {
        let subdomain = validate_subdomain(subdomain)?;
        let host = format!("{}.{}", subdomain, base_domain.trim().trim_matches('.'));
        Ok(Self {
            socket_url: parse_with_scheme(&format!("wss://{}/ws", host), &["wss"])?,
            api_origin: parse_with_scheme(&format!("https://{}/", host), &["https"])?,
        })
    }

    /// Uses explicit URLs, for self-hosted backends and tests.
    pub fn from_urls(socket_url: &str, api_origin: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            socket_url: parse_with_scheme(socket_url, &["ws", "wss"])?,
            api_origin: parse_with_scheme(api_origin, &["http", "https"])?,
        })
    }

    /// Full URL of the address-list announcement.
    pub fn set_miner_ips_url(&self) -> Result<Url, ConfigError> {
        let mut origin = self.api_origin.clone();
        if !origin.path().ends_with('/') {
            let path = format!("{}/", origin.path());
            origin.set_path(&path);
        }
        origin.join(SET_MINER_IPS_PATH).map_err(|source| ConfigError::InvalidUrl {
            url: self.api_origin.to_string(),
            source,
        })
    }
}

/// The user's persisted tunnel subdomain.
#[derive(Clone)]
pub struct SubdomainSetting {
    storage: Arc<dyn LocalStorage>,
}

impl SubdomainSetting {
    /// Binds the setting to a storage backend.
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    /// The stored subdomain, or [`DEFAULT_SUBDOMAIN`] when none (or an invalid
    /// one) is stored.
    pub fn get(&self) -> String {
        match self.storage.get_item(SUBDOMAIN_KEY) {
            Ok(Some(stored)) => match validate_subdomain(&stored) {
                Ok(subdomain) => subdomain,
                Err(e) => {
                    log::warn!("{}; falling back to '{}'", e, DEFAULT_SUBDOMAIN);
                    DEFAULT_SUBDOMAIN.to_string()
                }
            },
            Ok(None) => DEFAULT_SUBDOMAIN.to_string(),
            Err(e) => {
                log::warn!("Could not read the feed subdomain: {}", e);
                DEFAULT_SUBDOMAIN.to_string()
            }
        }
    }

    /// Validates and stores a new subdomain; returns the normalized value.
    pub fn set(&self, subdomain: &str) -> Result<String, ConfigError> {
        let subdomain = validate_subdomain(subdomain)?;
        self.storage.set_item(SUBDOMAIN_KEY, &subdomain)?;
        log::info!("Feed subdomain set to '{}'", subdomain);
        Ok(subdomain)
    }

    /// Forgets the stored value so the default applies again.
    pub fn reset(&self) -> Result<(), ConfigError> {
        Ok(self.storage.remove_item(SUBDOMAIN_KEY)?)
    }
}

impl std::fmt::Debug for SubdomainSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubdomainSetting").field("current", &self.get()).finish()
    }
}
