//! Configuration loading and representation.
//!
//! Everything is read from environment-style key/value pairs. `from_env()` is
//! what the binary uses; `from_lookup()` lets tests feed a plain map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use assetbridge_core::AssetId;

pub const DEFAULT_ASSETS_API_URL: &str = "https://apis.roblox.com/assets/v1/assets";
pub const DEFAULT_ASSET_DELIVERY_URL: &str = "https://assetdelivery.roblox.com/v1/asset?id=";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be at least 1")]
    Zero { key: &'static str },
}

/// Retry/poll budget for the external operation client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Fixed delay between submission attempts.
    pub retry_delay: Duration,
    /// Submission attempt ceiling.
    pub max_retries: u32,
    /// Fixed delay between operation-status polls.
    pub poll_interval: Duration,
    /// Maximum number of operation-status polls.
    pub max_polls: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(5000),
            max_retries: 3,
            poll_interval: Duration::from_millis(3000),
            max_polls: 40,
        }
    }
}

/// Chained action (auto-publish) settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainedActionConfig {
    pub enabled: bool,
    /// Target URL with an `{assetId}` placeholder.
    pub url_template: Option<String>,
    /// Eligible asset ids; empty means every asset is eligible.
    pub allow_list: Vec<AssetId>,
}

impl ChainedActionConfig {
    /// Whether the action should be considered at all.
    pub fn is_active(&self) -> bool {
        self.enabled && self.url_template.is_some()
    }

    pub fn allows(&self, asset_id: &AssetId) -> bool {
        self.allow_list.is_empty() || self.allow_list.contains(asset_id)
    }
}

/// Endpoints and credentials for the external assets API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetsApiConfig {
    pub assets_url: String,
    pub operations_url: String,
    /// Base-asset download prefix; the encoded asset id is appended.
    pub delivery_url: String,
    pub bearer_token: Option<String>,
    pub api_key: Option<String>,
}

impl Default for AssetsApiConfig {
    fn default() -> Self {
        Self {
            assets_url: DEFAULT_ASSETS_API_URL.to_string(),
            operations_url: derive_operations_url(DEFAULT_ASSETS_API_URL),
            delivery_url: DEFAULT_ASSET_DELIVERY_URL.to_string(),
            bearer_token: None,
            api_key: None,
        }
    }
}

/// Full bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub retry: RetryConfig,
    pub chained_action: ChainedActionConfig,
    pub api: AssetsApiConfig,
    /// Job-list file.
    pub store_path: PathBuf,
    /// Directory for generated documents, audit files and dedup state.
    pub out_dir: PathBuf,
    /// Notification sink; `None` means log-only.
    pub webhook_url: Option<String>,
    /// Overrides the asset type of every upload.
    pub asset_type: Option<String>,
    /// Shared secret uploads must present; `None` disables the check.
    pub experience_secret: Option<String>,
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            chained_action: ChainedActionConfig::default(),
            api: AssetsApiConfig::default(),
            store_path: PathBuf::from("queue.json"),
            out_dir: PathBuf::from("out"),
            webhook_url: None,
            asset_type: None,
            experience_secret: None,
            port: 3000,
        }
    }
}

impl BridgeConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a map (tests, embedding).
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| map.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| sanitize(&v)).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let retry = RetryConfig {
            retry_delay: Duration::from_millis(number(&get, "RETRY_DELAY_MS", 5000)?),
            max_retries: non_zero(number(&get, "MAX_RETRIES", 3)?, "MAX_RETRIES")?,
            poll_interval: Duration::from_millis(number(&get, "OPERATION_POLL_INTERVAL_MS", 3000)?),
            max_polls: non_zero(number(&get, "MAX_OPERATION_POLLS", 40)?, "MAX_OPERATION_POLLS")?,
        };

        let allow_list = get("ALLOWLIST_ASSET_IDS")
            .or_else(|| get("ASSET_ALLOWLIST"))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(AssetId::from)
                    .collect()
            })
            .unwrap_or_default();

        let chained_action = ChainedActionConfig {
            enabled: get("AUTO_PUBLISH").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            url_template: get("PUBLISH_API_URL").or_else(|| get("PUBLISH_API_URL_TEMPLATE")),
            allow_list,
        };

        let assets_url = get("ASSETS_API_URL").unwrap_or(defaults.api.assets_url);
        let operations_url =
            get("ASSETS_OPERATIONS_URL").unwrap_or_else(|| derive_operations_url(&assets_url));
        let api = AssetsApiConfig {
            assets_url,
            operations_url,
            delivery_url: get("ASSET_DELIVERY_URL").unwrap_or(defaults.api.delivery_url),
            bearer_token: get("API_BEARER_TOKEN"),
            api_key: get("API_KEY"),
        };

        let port: u64 = number(&get, "PORT", u64::from(defaults.port))?;
        let port = u16::try_from(port).map_err(|_| ConfigError::InvalidNumber {
            key: "PORT",
            value: port.to_string(),
        })?;

        Ok(Self {
            retry,
            chained_action,
            api,
            store_path: get("QUEUE_PERSIST_PATH").map(PathBuf::from).unwrap_or(defaults.store_path),
            out_dir: get("OUT_DIR").map(PathBuf::from).unwrap_or(defaults.out_dir),
            webhook_url: get("WEBHOOK_URL"),
            asset_type: get("ASSET_TYPE"),
            experience_secret: get("EXPERIENCE_SECRET"),
            port,
        })
    }

    /// Where the notification dedup state is persisted.
    pub fn dedup_state_path(&self) -> PathBuf {
        self.out_dir.join(".webhook_state.json")
    }
}

/// Strip surrounding whitespace and one pair of double quotes (`KEY="value"`).
fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}

fn derive_operations_url(assets_url: &str) -> String {
    format!("{}/operations", assets_url.trim_end_matches('/'))
}

fn number<T, F>(get: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

fn non_zero(value: u32, key: &'static str) -> Result<u32, ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { key })
    } else {
        Ok(value)
    }
}
