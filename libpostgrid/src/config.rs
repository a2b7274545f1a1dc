//! Configuration management for Postgrid
//!
//! Configuration is read from a TOML file and then overlaid with environment
//! variables, so deployments can keep OAuth secrets out of the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Provider identifiers whose credentials can be supplied through the
/// environment as `<PREFIX>_CLIENT_ID` / `<PREFIX>_CLIENT_SECRET`.
const ENV_PROVIDERS: &[(&str, &str)] = &[
    ("x", "X"),
    ("linkedin", "LINKEDIN"),
    ("reddit", "REDDIT"),
    ("mastodon", "MASTODON"),
    ("instagram", "INSTAGRAM"),
    ("threads", "THREADS"),
    ("tiktok", "TIKTOK"),
    ("discord", "DISCORD"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub shortlink: ShortLinkConfig,
    #[serde(default)]
    pub sso: SsoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public URL of the web frontend; OAuth redirects land below it
    pub frontend_url: String,
    /// HS256 key for SSO session tokens
    #[serde(default)]
    pub jwt_secret: String,
}

/// Retry policy for individual vendor HTTP calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub delay: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay: default_retry_delay(),
        }
    }
}

/// Retry policy for whole publish jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingConfig {
    #[serde(default = "default_publish_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_publish_base_delay")]
    pub base_delay: String,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_publish_attempts(),
            base_delay: default_publish_base_delay(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Discord bot token used for posting
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Mastodon instance or Bluesky PDS base URL
    #[serde(default)]
    pub instance: Option<String>,
    /// Overrides the vendor API base URL
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub poll: Option<PollConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval: String,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShortLinkProvider {
    #[default]
    Empty,
    Dub,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShortLinkConfig {
    #[serde(default)]
    pub provider: ShortLinkProvider,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_signature_tolerance")]
    pub signature_tolerance: String,
    #[serde(default = "default_session_ttl")]
    pub session_ttl: String,
    #[serde(default = "default_login_code_ttl")]
    pub login_code_ttl: String,
    #[serde(default = "default_health_interval")]
    pub health_interval: String,
    #[serde(default = "default_analytics_interval")]
    pub analytics_interval: String,
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
            signature_tolerance: default_signature_tolerance(),
            session_ttl: default_session_ttl(),
            login_code_ttl: default_login_code_ttl(),
            health_interval: default_health_interval(),
            analytics_interval: default_analytics_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> String {
    "5s".to_string()
}
fn default_publish_attempts() -> u32 {
    3
}
fn default_publish_base_delay() -> String {
    "1s".to_string()
}
fn default_cache_ttl() -> String {
    "10m".to_string()
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_signature_tolerance() -> String {
    "5m".to_string()
}
fn default_session_ttl() -> String {
    "7days".to_string()
}
fn default_login_code_ttl() -> String {
    "2m".to_string()
}
fn default_health_interval() -> String {
    "5m".to_string()
}
fn default_analytics_interval() -> String {
    "1h".to_string()
}

/// Parse a human-readable duration such as `"5s"` or `"1h 30m"`
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

impl PollConfig {
    pub fn interval(&self) -> Result<Duration> {
        parse_duration("poll.interval", &self.interval)
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path, then apply environment overrides
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string without touching the environment
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/postgrid/postgrid.db".to_string(),
            },
            server: ServerConfig {
                frontend_url: "http://localhost:4200".to_string(),
                jwt_secret: String::new(),
            },
            retry: RetryConfig::default(),
            publishing: PublishingConfig::default(),
            providers: BTreeMap::new(),
            shortlink: ShortLinkConfig::default(),
            sso: SsoConfig::default(),
        }
    }

    /// Overlay deployment settings from the process environment
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("FRONTEND_URL") {
            self.server.frontend_url = url;
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.server.jwt_secret = secret;
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            self.database.path = path;
        }

        for (identifier, prefix) in ENV_PROVIDERS {
            let client_id = std::env::var(format!("{}_CLIENT_ID", prefix)).ok();
            let client_secret = std::env::var(format!("{}_CLIENT_SECRET", prefix)).ok();
            if client_id.is_none() && client_secret.is_none() {
                continue;
            }
            let entry = self
                .providers
                .entry(identifier.to_string())
                .or_insert_with(|| ProviderConfig {
                    enabled: true,
                    ..Default::default()
                });
            if let Some(id) = client_id {
                entry.client_id = id;
            }
            if let Some(secret) = client_secret {
                entry.client_secret = secret;
            }
        }

        if let Ok(instance) = std::env::var("MASTODON_URL") {
            if let Some(mastodon) = self.providers.get_mut("mastodon") {
                mastodon.instance = Some(instance);
            }
        }
        if let Ok(token) = std::env::var("DISCORD_BOT_TOKEN_ID") {
            if let Some(discord) = self.providers.get_mut("discord") {
                discord.bot_token = Some(token);
            }
        }
        if let Ok(token) = std::env::var("DUB_TOKEN") {
            self.shortlink.provider = ShortLinkProvider::Dub;
            self.shortlink.token = Some(token);
        }
        if let Ok(domain) = std::env::var("DUB_SHORT_LINK_DOMAIN") {
            self.shortlink.domain = Some(domain);
        }
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.server.frontend_url.is_empty() {
            return Err(ConfigError::MissingField("server.frontend_url".to_string()).into());
        }
        parse_duration("retry.delay", &self.retry.delay)?;
        parse_duration("publishing.base_delay", &self.publishing.base_delay)?;
        parse_duration("sso.cache_ttl", &self.sso.cache_ttl)?;
        parse_duration("sso.signature_tolerance", &self.sso.signature_tolerance)?;
        parse_duration("sso.session_ttl", &self.sso.session_ttl)?;
        parse_duration("sso.login_code_ttl", &self.sso.login_code_ttl)?;
        parse_duration("sso.health_interval", &self.sso.health_interval)?;
        parse_duration("sso.analytics_interval", &self.sso.analytics_interval)?;

        for (identifier, provider) in &self.providers {
            if let Some(poll) = &provider.poll {
                poll.interval()?;
                if poll.max_attempts == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: format!("providers.{}.poll.max_attempts", identifier),
                        message: "must be at least 1".to_string(),
                    }
                    .into());
                }
            }
        }

        if self.shortlink.provider == ShortLinkProvider::Dub && self.shortlink.token.is_none() {
            return Err(ConfigError::MissingField("shortlink.token".to_string()).into());
        }
        Ok(())
    }

    /// Configuration for one provider if it is present and enabled
    pub fn provider(&self, identifier: &str) -> Option<&ProviderConfig> {
        self.providers.get(identifier).filter(|p| p.enabled)
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("POSTGRID_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("postgrid").join("config.toml"))
}
