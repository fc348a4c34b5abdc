use crate::rate_limiter::RateLimitSettings;
use crate::storage::QueryLimits;
use crate::validator::ValidationLimits;
use config::{Config as ConfigTree, ConfigError, Environment, File};
use nostr::{Keys, PublicKey, SecretKey};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

const ENVIRONMENT_PREFIX: &str = "RELAY";
const CONFIG_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    pub local_addr: String,
    pub relay_url: String,
    pub db_path: String,
    #[serde(default)]
    pub relay_secret_key: Option<String>,
    /// Seeded into the whitelist with the admin cohort on every startup.
    #[serde(default)]
    pub admin_pubkeys: Vec<String>,
    #[serde(default = "default_cohort")]
    pub default_cohort: String,
    #[serde(default = "default_admin_cohort")]
    pub admin_cohort: String,
    /// Section name to the cohorts allowed to post in it. A section that is
    /// missing here is open to every whitelisted pubkey.
    #[serde(default)]
    pub sections: HashMap<String, BTreeSet<String>>,
    /// Refuse REQ from connections that have not completed AUTH.
    #[serde(default)]
    pub read_requires_auth: bool,
    #[serde(default)]
    pub validation: ValidationLimits,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub query: QueryLimits,
    #[serde(default)]
    pub websocket: WebSocketSettings,
    #[serde(default)]
    pub info: RelayInfoSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketSettings {
    #[serde(
        default = "default_channel_size",
        deserialize_with = "validate_channel_size"
    )]
    pub channel_size: usize,
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    pub max_connection_time: Option<Duration>,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            channel_size: default_channel_size(),
            idle_timeout: default_idle_timeout(),
            max_connection_time: None,
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelayInfoSettings {
    pub name: String,
    pub description: String,
    pub contact: String,
}

impl Default for RelayInfoSettings {
    fn default() -> Self {
        Self {
            name: "Whitelist Relay".to_string(),
            description: "A private relay for whitelisted members".to_string(),
            contact: String::new(),
        }
    }
}

fn default_cohort() -> String {
    "member".to_string()
}

fn default_admin_cohort() -> String {
    "admin".to_string()
}

fn default_channel_size() -> usize {
    300
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_max_message_bytes() -> usize {
    128 * 1024
}

fn validate_channel_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let size = usize::deserialize(deserializer)?;
    if size == 0 {
        return Err(D::Error::custom("channel_size must be greater than 0"));
    }
    Ok(size)
}

impl RelaySettings {
    /// Relay identity advertised in the relay information document. A fresh
    /// key is generated when none is configured.
    pub fn relay_keys(&self) -> Result<Keys, anyhow::Error> {
        match &self.relay_secret_key {
            Some(secret) if !secret.is_empty() => {
                let secret_key = SecretKey::from_hex(secret)?;
                Ok(Keys::new(secret_key))
            }
            _ => Ok(Keys::generate()),
        }
    }

    pub fn admin_keys(&self) -> Result<Vec<PublicKey>, anyhow::Error> {
        self.admin_pubkeys
            .iter()
            .map(|hex| Ok(PublicKey::from_hex(hex)?))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    config: ConfigTree,
}

impl Config {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let environment =
            std::env::var(format!("{ENVIRONMENT_PREFIX}{CONFIG_SEPARATOR}ENVIRONMENT"))
                .unwrap_or_else(|_| "development".into());

        let config_dir = config_dir.as_ref();
        let default_config = config_dir.join("settings.yml");
        let env_config = config_dir.join(format!("settings.{}.yml", environment));
        let local_config = config_dir.join("settings.local.yml");

        let config = ConfigTree::builder()
            .add_source(File::from(default_config))
            .add_source(File::from(env_config).required(false))
            .add_source(File::from(local_config).required(false))
            .add_source(
                Environment::with_prefix(ENVIRONMENT_PREFIX)
                    .separator(CONFIG_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        Ok(Config { config })
    }

    pub fn get_settings(&self) -> Result<RelaySettings, ConfigError> {
        let settings: RelaySettings = self.config.get("relay")?;
        tracing::debug!(
            "WebSocket config: channel_size={}, idle_timeout={:?}, max_connection_time={:?}",
            settings.websocket.channel_size,
            settings.websocket.idle_timeout,
            settings.websocket.max_connection_time,
        );
        tracing::debug!(
            "Rate limit: {} events per {:?}, {} connections per source",
            settings.rate_limit.max_events,
            settings.rate_limit.window,
            settings.rate_limit.max_connections_per_source,
        );
        Ok(settings)
    }
}
