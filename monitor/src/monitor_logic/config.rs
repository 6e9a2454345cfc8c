use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::configs::feed_endpoint::{DEFAULT_BASE_DOMAIN, DEFAULT_SUBDOMAIN};
use lib_common::telemetry::SiteLayout;
use lib_common::{Backoff, FeedConfig, FeedEndpoint, SubdomainSetting};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Miner telemetry monitor", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "MINER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "MINER_SUBDOMAIN", help = "Tunnel subdomain of the feed. Persisted once given.")]
    pub subdomain: Option<String>,

    #[arg(long, env = "MINER_BASE_DOMAIN", help = "Domain the tunnel subdomain lives under.")]
    pub base_domain: Option<String>,

    #[arg(long, env = "MINER_FEED_URL", help = "Explicit WebSocket URL, overriding the subdomain.")]
    pub feed_url: Option<String>,

    #[arg(long, env = "MINER_API_ORIGIN", help = "Explicit control API origin, overriding the subdomain.")]
    pub api_origin: Option<String>,

    #[arg(long, env = "MINER_API_TOKEN", help = "Bearer token for the control API.")]
    pub api_token: Option<String>,

    #[arg(long, env = "MINER_USER_ID", help = "Account the tracked miners are registered for.")]
    pub user_id: Option<String>,

    #[arg(long, env = "MINER_IPS", value_delimiter = ',', help = "Comma-separated miner addresses to track.")]
    pub miners: Option<Vec<String>>,

    #[arg(long, env = "MINER_STATE_DIR", help = "Directory for persisted snapshots and settings.")]
    pub state_dir: Option<PathBuf>,

    #[arg(long, env = "MINER_LAYOUT_PATH", help = "Path to the JSON site layout.")]
    pub layout_path: Option<PathBuf>,

    #[arg(long, env = "MINER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "MINER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "MINER_LOG_KEEP", help = "How many log files to keep, the current one included.")]
    pub log_keep: Option<usize>,

    #[arg(long, env = "MINER_RECONNECT_INITIAL_DELAY_MS", help = "First reconnect delay in milliseconds.")]
    pub reconnect_initial_delay_ms: Option<u64>,

    #[arg(long, env = "MINER_RECONNECT_MAX_DELAY_MS", help = "Reconnect delay ceiling in milliseconds.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[arg(long, env = "MINER_RECONNECT_FACTOR", help = "Growth factor of the reconnect delay.")]
    pub reconnect_factor: Option<f64>,

    #[arg(long, env = "MINER_IDLE_TIMEOUT_SECONDS", help = "Reconnect when the feed is silent this long (0 disables).")]
    pub idle_timeout_seconds: Option<u64>,

    #[arg(long, env = "MINER_SUMMARY_INTERVAL_SECONDS", help = "Seconds between fleet summary log lines.")]
    pub summary_interval_seconds: Option<u64>,

    #[arg(
        long,
        env = "MINER_RESET_STATE",
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Forget every persisted miner snapshot before connecting."
    )]
    pub reset_state: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            subdomain: other.subdomain.or(self.subdomain),
            base_domain: other.base_domain.or(self.base_domain),
            feed_url: other.feed_url.or(self.feed_url),
            api_origin: other.api_origin.or(self.api_origin),
            api_token: other.api_token.or(self.api_token),
            user_id: other.user_id.or(self.user_id),
            miners: other.miners.or(self.miners),
            state_dir: other.state_dir.or(self.state_dir),
            layout_path: other.layout_path.or(self.layout_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_keep: other.log_keep.or(self.log_keep),
            reconnect_initial_delay_ms: other.reconnect_initial_delay_ms.or(self.reconnect_initial_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            reconnect_factor: other.reconnect_factor.or(self.reconnect_factor),
            idle_timeout_seconds: other.idle_timeout_seconds.or(self.idle_timeout_seconds),
            summary_interval_seconds: other.summary_interval_seconds.or(self.summary_interval_seconds),
            reset_state: other.reset_state.or(self.reset_state),
        }
    }

    fn defaults() -> Config {
        Config {
            base_domain: Some(DEFAULT_BASE_DOMAIN.to_string()),
            state_dir: Some(default_state_dir()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_keep: Some(1),
            reconnect_initial_delay_ms: Some(5_000),
            reconnect_max_delay_ms: Some(50_000),
            reconnect_factor: Some(1.5),
            idle_timeout_seconds: Some(0),
            summary_interval_seconds: Some(60),
            reset_state: Some(false),
            ..Default::default()
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn log_keep(&self) -> usize {
        self.log_keep.unwrap_or(1).max(1)
    }

    pub fn reset_state(&self) -> bool {
        self.reset_state.unwrap_or(false)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_seconds.unwrap_or(60).max(1))
    }

    /// Socket and API endpoints: derived from the subdomain, then overridden
    /// field by field by `feed_url` / `api_origin`.
    pub fn endpoint(&self, subdomain: &str) -> Result<FeedEndpoint> {
        let base_domain = self.base_domain.as_deref().unwrap_or(DEFAULT_BASE_DOMAIN);
        let derived = FeedEndpoint::from_subdomain(subdomain, base_domain)?;
        if self.feed_url.is_none() && self.api_origin.is_none() {
            return Ok(derived);
        }
        let socket_url = self.feed_url.clone().unwrap_or_else(|| derived.socket_url.to_string());
        let api_origin = self.api_origin.clone().unwrap_or_else(|| derived.api_origin.to_string());
        Ok(FeedEndpoint::from_urls(&socket_url, &api_origin)?)
    }

    pub fn feed_config(&self, endpoint: FeedEndpoint) -> Result<FeedConfig> {
        let Some(user_id) = self.user_id.clone().filter(|id| !id.trim().is_empty()) else {
            bail!("user_id is required (--user-id or MINER_USER_ID)");
        };
        let mut feed = FeedConfig::new(endpoint, user_id);
        feed.backoff = Backoff::new(
            Duration::from_millis(self.reconnect_initial_delay_ms.unwrap_or(5_000)),
            Duration::from_millis(self.reconnect_max_delay_ms.unwrap_or(50_000)),
            self.reconnect_factor.unwrap_or(1.5),
        );
        feed.auth_token = self.api_token.clone();
        feed.idle_timeout = self
            .idle_timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        Ok(feed)
    }

    /// Addresses from `miners` followed by those of the layout, if any.
    pub fn tracked_addresses(&self, layout: Option<&SiteLayout>) -> Vec<String> {
        let mut addresses = self.miners.clone().unwrap_or_default();
        if let Some(layout) = layout {
            addresses.extend(layout.tracked_addresses());
        }
        addresses
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .map(|dir| dir.join("miner_monitor"))
        .unwrap_or_else(|| PathBuf::from("./state"))
}

fn read_config_file(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Defaults, then the JSON file, then environment and CLI (already folded
/// together by clap in `cli`).
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("miner_monitor.conf"));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        match read_config_file(&config_file_path) {
            Ok(file_config) => current_config = current_config.merge(file_config),
            Err(e) => log::warn!("{:#}. Falling back to other sources.", e),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

/// The subdomain to use: a configured one is validated and persisted,
/// otherwise the persisted (or default) one is used.
pub fn choose_subdomain(config: &Config, setting: &SubdomainSetting) -> Result<String> {
    match config.subdomain.as_deref() {
        Some(subdomain) => Ok(setting.set(subdomain)?),
        None => {
            let subdomain = setting.get();
            if subdomain == DEFAULT_SUBDOMAIN {
                log::info!("Using the default feed subdomain '{}'.", subdomain);
            }
            Ok(subdomain)
        }
    }
}
