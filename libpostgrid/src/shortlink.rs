//! Link shortening for outgoing posts
//!
//! A [`ShortLinking`] provider turns URLs into short links and back. The
//! [`ShortLinkService`] applies a provider to whole messages. With the
//! [`EmptyShortLinking`] provider every conversion is the identity.

use async_trait::async_trait;
use regex::{Captures, Regex};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::config::{ShortLinkConfig, ShortLinkProvider};
use crate::error::{ConfigError, ProviderError, Result};
use crate::providers::http::{no_classification, ProviderHttp};

const DUB_API_URL: &str = "https://api.dub.co";
const DUB_DOMAIN: &str = "dub.sh";

/// Click statistics for one short link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatistics {
    pub short: String,
    pub original: String,
    pub clicks: u64,
}

#[async_trait]
pub trait ShortLinking: Send + Sync {
    fn identifier(&self) -> &str;

    /// Host name of generated short links; empty when links are not shortened
    fn short_link_domain(&self) -> &str;

    async fn links_statistics(&self, links: &[String]) -> Result<Vec<LinkStatistics>>;

    /// Shorten `link` on behalf of organization `id`
    async fn convert_link_to_short_link(&self, id: &str, link: &str) -> Result<String>;

    async fn convert_short_link_to_link(&self, short_link: &str) -> Result<String>;
}

/// Provider used when no shortener is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyShortLinking;

#[async_trait]
impl ShortLinking for EmptyShortLinking {
    fn identifier(&self) -> &str {
        "empty"
    }

    fn short_link_domain(&self) -> &str {
        ""
    }

    async fn links_statistics(&self, _links: &[String]) -> Result<Vec<LinkStatistics>> {
        Ok(Vec::new())
    }

    async fn convert_link_to_short_link(&self, _id: &str, link: &str) -> Result<String> {
        Ok(link.to_string())
    }

    async fn convert_short_link_to_link(&self, short_link: &str) -> Result<String> {
        Ok(short_link.to_string())
    }
}

/// Dub (dub.co) link shortener
pub struct DubShortLinking {
    http: ProviderHttp,
    token: SecretString,
    domain: String,
    api_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DubLink {
    url: String,
    #[serde(default)]
    short_link: String,
    #[serde(default)]
    clicks: u64,
}

impl DubShortLinking {
    pub fn new(http: ProviderHttp, token: impl Into<String>) -> Self {
        Self {
            http,
            token: SecretString::from(token.into()),
            domain: DUB_DOMAIN.to_string(),
            api_url: DUB_API_URL.to_string(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }

    /// Look up a short link by its key (the path after the domain)
    async fn info(&self, short_link: &str) -> Result<DubLink> {
        let key = short_link
            .split_once(&format!("{}/", self.domain))
            .map(|(_, key)| key)
            .unwrap_or(short_link)
            .trim_end_matches('/');
        let request = self
            .http
            .client()
            .get(self.url("/links/info"))
            .query(&[("domain", self.domain.as_str()), ("key", key)])
            .bearer_auth(self.token.expose_secret());
        Ok(self
            .http
            .fetch("dub", request, no_classification)
            .await?
            .json()
            .await?)
    }
}

#[async_trait]
impl ShortLinking for DubShortLinking {
    fn identifier(&self) -> &str {
        "dub"
    }

    fn short_link_domain(&self) -> &str {
        &self.domain
    }

    async fn links_statistics(&self, links: &[String]) -> Result<Vec<LinkStatistics>> {
        let mut statistics = Vec::with_capacity(links.len());
        for link in links {
            let info = self.info(link).await?;
            statistics.push(LinkStatistics {
                short: link.clone(),
                original: info.url,
                clicks: info.clicks,
            });
        }
        Ok(statistics)
    }

    async fn convert_link_to_short_link(&self, id: &str, link: &str) -> Result<String> {
        let request = self
            .http
            .client()
            .post(self.url("/links"))
            .bearer_auth(self.token.expose_secret())
            .json(&json!({ "url": link, "tenantId": id, "domain": self.domain }));
        let created: DubLink = self
            .http
            .fetch("dub", request, no_classification)
            .await?
            .json()
            .await?;
        if created.short_link.is_empty() {
            return Err(ProviderError::Posting(format!("Dub returned no short link for {}", link)).into());
        }
        Ok(created.short_link)
    }

    async fn convert_short_link_to_link(&self, short_link: &str) -> Result<String> {
        Ok(self.info(short_link).await?.url)
    }
}

fn url_regex() -> &'static Regex {
    static URLS: OnceLock<Regex> = OnceLock::new();
    URLS.get_or_init(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("Valid regex"))
}

/// `matched` without trailing sentence punctuation
fn trim_url(matched: &str) -> &str {
    matched.trim_end_matches(['.', ',', '!', '?', ';', ':', ')'])
}

/// Absolute URLs in `text`, without trailing sentence punctuation
fn find_urls(text: &str) -> Vec<String> {
    url_regex()
        .find_iter(text)
        .map(|m| trim_url(m.as_str()).to_string())
        .collect()
}

/// Replace every URL found in `text` that has an entry in `replacements`
///
/// Each match is rewritten once, so a URL that is a prefix of another one
/// never touches the longer URL.
fn rewrite_urls(text: &str, replacements: &HashMap<String, String>) -> String {
    url_regex()
        .replace_all(text, |caps: &Captures| {
            let matched = &caps[0];
            let url = trim_url(matched);
            match replacements.get(url) {
                Some(replacement) => format!("{}{}", replacement, &matched[url.len()..]),
                None => matched.to_string(),
            }
        })
        .into_owned()
}

/// Applies a [`ShortLinking`] provider to post messages
#[derive(Clone)]
pub struct ShortLinkService {
    provider: Arc<dyn ShortLinking>,
}

impl ShortLinkService {
    pub fn new(provider: Arc<dyn ShortLinking>) -> Self {
        Self { provider }
    }

    pub fn from_config(config: &ShortLinkConfig, http: ProviderHttp) -> Result<Self> {
        let provider: Arc<dyn ShortLinking> = match config.provider {
            ShortLinkProvider::Empty => Arc::new(EmptyShortLinking),
            ShortLinkProvider::Dub => {
                let token = config
                    .token
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField("shortlink.token".to_string()))?;
                let mut dub = DubShortLinking::new(http, token);
                if let Some(domain) = &config.domain {
                    dub = dub.with_domain(domain.clone());
                }
                if let Some(url) = &config.api_url {
                    dub = dub.with_api_url(url.clone());
                }
                Arc::new(dub)
            }
        };
        Ok(Self::new(provider))
    }

    pub fn provider(&self) -> &Arc<dyn ShortLinking> {
        &self.provider
    }

    fn is_short_link(&self, url: &str) -> bool {
        let domain = self.provider.short_link_domain();
        !domain.is_empty()
            && url
                .split_once("://")
                .map(|(_, rest)| rest.starts_with(&format!("{}/", domain)))
                .unwrap_or(false)
    }

    /// Whether `messages` contain links that would be shortened
    pub fn ask_short_link(&self, messages: &[String]) -> bool {
        if self.provider.short_link_domain().is_empty() {
            return false;
        }
        messages
            .iter()
            .flat_map(|m| find_urls(m))
            .any(|url| !self.is_short_link(&url))
    }

    /// Replace every long URL in `messages` with a short link
    pub async fn convert_text_to_short_links(&self, id: &str, messages: &[String]) -> Result<Vec<String>> {
        if self.provider.short_link_domain().is_empty() {
            return Ok(messages.to_vec());
        }

        let mut shortened: HashMap<String, String> = HashMap::new();
        for url in messages.iter().flat_map(|m| find_urls(m)) {
            if self.is_short_link(&url) || shortened.contains_key(&url) {
                continue;
            }
            let short = self.provider.convert_link_to_short_link(id, &url).await?;
            debug!(original = %url, short = %short, "Shortened link");
            shortened.insert(url, short);
        }

        Ok(messages
            .iter()
            .map(|message| rewrite_urls(message, &shortened))
            .collect())
    }

    /// Expand every short link in `message` back to its original URL
    pub async fn convert_short_links_to_links(&self, message: &str) -> Result<String> {
        if self.provider.short_link_domain().is_empty() {
            return Ok(message.to_string());
        }

        let mut originals: HashMap<String, String> = HashMap::new();
        for url in find_urls(message) {
            if !self.is_short_link(&url) || originals.contains_key(&url) {
                continue;
            }
            let original = self.provider.convert_short_link_to_link(&url).await?;
            originals.insert(url, original);
        }
        Ok(rewrite_urls(message, &originals))
    }

    /// Click statistics for the short links found in `messages`
    pub async fn statistics(&self, messages: &[String]) -> Result<Vec<LinkStatistics>> {
        let mut links: Vec<String> = messages
            .iter()
            .flat_map(|m| find_urls(m))
            .filter(|url| self.is_short_link(url))
            .collect();
        links.sort();
        links.dedup();
        if links.is_empty() {
            return Ok(Vec::new());
        }
        self.provider.links_statistics(&links).await
    }
}
