//! Provider lookup by identifier

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::bluesky::{self, BlueskyProvider};
use super::discord::{self, DiscordProvider};
use super::http::{OAuthApp, PollPolicy, ProviderHttp, RetryPolicy};
use super::instagram::{self, InstagramProvider};
use super::linkedin::{self, LinkedInProvider};
use super::mastodon::{self, MastodonProvider};
use super::reddit::{self, RedditProvider};
use super::threads::{self, ThreadsProvider};
use super::tiktok::{self, TikTokProvider};
use super::x::{self, XProvider};
use super::SocialProvider;
use crate::config::{Config, ProviderConfig};
use crate::error::{ProviderError, Result};

/// Maps provider identifiers to adapter instances
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn SocialProvider>>,
}

fn poll_override(config: &ProviderConfig) -> Result<Option<PollPolicy>> {
    config.poll.as_ref().map(PollPolicy::from_config).transpose()
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled provider from configuration
    ///
    /// Providers without a `[providers.<id>]` section (or with
    /// `enabled = false`) are skipped. Unknown identifiers are logged and
    /// ignored.
    pub fn from_config(config: &Config) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.retry)?;
        let frontend = config.server.frontend_url.as_str();
        let mut registry = Self::new();

        for (identifier, provider) in config.providers.iter().filter(|(_, p)| p.enabled) {
            let http = ProviderHttp::new(retry);
            let app = OAuthApp::from_config(provider, frontend);
            let poll = poll_override(provider)?;
            let api_url = provider.api_url.clone();

            let built: Arc<dyn SocialProvider> = match identifier.as_str() {
                x::IDENTIFIER => {
                    let mut p = XProvider::new(app, http);
                    if let Some(url) = api_url {
                        p = p.with_api_url(url);
                    }
                    if let Some(poll) = poll {
                        p = p.with_poll_policy(poll);
                    }
                    Arc::new(p)
                }
                linkedin::IDENTIFIER => {
                    let mut p = LinkedInProvider::new(app, http);
                    if let Some(url) = api_url {
                        p = p.with_api_url(url);
                    }
                    Arc::new(p)
                }
                reddit::IDENTIFIER => {
                    let mut p = RedditProvider::new(app, http);
                    if let Some(url) = api_url {
                        p = p.with_api_url(url);
                    }
                    Arc::new(p)
                }
                mastodon::IDENTIFIER => {
                    let instance = provider
                        .instance
                        .clone()
                        .unwrap_or_else(|| mastodon::DEFAULT_INSTANCE.to_string());
                    let mut p = MastodonProvider::new(app, http, instance);
                    if let Some(poll) = poll {
                        p = p.with_poll_policy(poll);
                    }
                    Arc::new(p)
                }
                bluesky::IDENTIFIER => {
                    let mut p = BlueskyProvider::new(http);
                    if let Some(url) = provider.instance.clone().or(api_url) {
                        p = p.with_service(url);
                    }
                    if let Some(poll) = poll {
                        p = p.with_poll_policy(poll);
                    }
                    Arc::new(p)
                }
                instagram::IDENTIFIER => {
                    let mut p = InstagramProvider::new(app, http);
                    if let Some(url) = api_url {
                        p = p.with_api_url(url);
                    }
                    if let Some(poll) = poll {
                        p = p.with_poll_policy(poll);
                    }
                    Arc::new(p)
                }
                threads::IDENTIFIER => {
                    let mut p = ThreadsProvider::new(app, http);
                    if let Some(url) = api_url {
                        p = p.with_api_url(url);
                    }
                    if let Some(poll) = poll {
                        p = p.with_poll_policy(poll);
                    }
                    Arc::new(p)
                }
                tiktok::IDENTIFIER => {
                    let mut p = TikTokProvider::new(app, http);
                    if let Some(url) = api_url {
                        p = p.with_api_url(url);
                    }
                    if let Some(poll) = poll {
                        p = p.with_poll_policy(poll);
                    }
                    Arc::new(p)
                }
                discord::IDENTIFIER => {
                    let bot_token = provider.bot_token.clone().ok_or_else(|| {
                        crate::error::ConfigError::MissingField(
                            "providers.discord.bot_token".to_string(),
                        )
                    })?;
                    let mut p = DiscordProvider::new(app, http, bot_token);
                    if let Some(url) = api_url {
                        p = p.with_api_url(url);
                    }
                    Arc::new(p)
                }
                other => {
                    warn!(provider = other, "Ignoring unknown provider in configuration");
                    continue;
                }
            };

            debug!(provider = %identifier, "Registered provider");
            registry.register(built);
        }

        Ok(registry)
    }

    /// Add or replace a provider under its own identifier
    pub fn register(&mut self, provider: Arc<dyn SocialProvider>) {
        self.providers
            .insert(provider.identifier().to_string(), provider);
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<dyn SocialProvider>> {
        self.providers.get(identifier).cloned()
    }

    /// Like [`ProviderRegistry::get`] but fails with `UnknownProvider`
    pub fn require(&self, identifier: &str) -> Result<Arc<dyn SocialProvider>> {
        self.get(identifier)
            .ok_or_else(|| ProviderError::UnknownProvider(identifier.to_string()).into())
    }

    /// Registered identifiers in sorted order
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.providers.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Declared concurrency limit for `identifier`
    pub fn max_concurrent_job(&self, identifier: &str) -> Option<usize> {
        self.providers
            .get(identifier)
            .map(|p| p.max_concurrent_job())
    }
}
