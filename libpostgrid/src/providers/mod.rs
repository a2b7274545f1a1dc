//! Social network adapters
//!
//! Every network is reached through the [`SocialProvider`] trait. Adapters
//! are stateless apart from their configuration: tokens are passed in on each
//! call and results are returned to the caller, which owns persistence.
//!
//! # Examples
//!
//! ```no_run
//! use libpostgrid::config::Config;
//! use libpostgrid::providers::ProviderRegistry;
//!
//! # fn example() -> libpostgrid::error::Result<()> {
//! let config = Config::load()?;
//! let registry = ProviderRegistry::from_config(&config)?;
//!
//! let linkedin = registry.require("linkedin")?;
//! let auth = linkedin.generate_auth_url()?;
//! println!("Send the user to {}", auth.url);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use crate::error::{ProviderError, Result};
use crate::types::{
    AnalyticsData, AuthTokenDetails, AuthenticateParams, CustomField, Editor,
    GenerateAuthUrlResponse, HandledError, Integration, MentionCandidate, PostDetails,
    PostResponse,
};

pub mod bluesky;
pub mod discord;
pub mod http;
pub mod instagram;
pub mod linkedin;
pub mod mastodon;
mod meta;
pub mod mock;
pub mod reddit;
pub mod registry;
pub mod threads;
pub mod tiktok;
pub mod x;

pub use http::{OAuthApp, PollPolicy, ProviderHttp, RetryPolicy};
pub use registry::ProviderRegistry;

/// Contract implemented by every social network adapter
///
/// Only the methods without a default body are mandatory. Optional
/// capabilities return [`ProviderError::NotImplemented`] unless an adapter
/// overrides them, so callers can check for support.
#[async_trait]
pub trait SocialProvider: Send + Sync {
    /// Stable lowercase identifier (e.g. "x", "linkedin")
    fn identifier(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    /// OAuth scopes requested during authorization and checked afterwards
    fn scopes(&self) -> &[&'static str];

    /// How many publish jobs may run against this network at once
    ///
    /// Providers only declare the limit; the publishing service enforces it.
    fn max_concurrent_job(&self) -> usize;

    /// Maximum message length, which may depend on account settings
    /// captured at authentication time
    fn max_length(&self, additional_settings: &serde_json::Value) -> usize;

    fn editor(&self) -> Editor {
        Editor::Normal
    }

    /// Whether authentication needs an extra selection step (e.g. picking a
    /// page or server) before the integration is usable
    fn is_between_steps(&self) -> bool {
        false
    }

    /// Credentials typed in by the user for providers without OAuth
    fn custom_fields(&self) -> Vec<CustomField> {
        Vec::new()
    }

    /// Whether [`SocialProvider::refresh_token`] is supported
    fn supports_refresh(&self) -> bool {
        true
    }

    /// Build the authorization URL; never performs network I/O
    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse>;

    /// Exchange an authorization code or credential payload for tokens
    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails>;

    /// Exchange a refresh (or long-lived) token for a fresh access token
    async fn refresh_token(&self, _refresh_token: &str) -> Result<AuthTokenDetails> {
        Err(not_implemented(self.identifier(), "token refresh"))
    }

    /// Publish a chain of posts
    ///
    /// Items are published in order and each may reference the previous
    /// item's network id (thread, comments or replies). Returns one
    /// [`PostResponse`] per published item, in input order.
    async fn post(
        &self,
        id: &str,
        access_token: &str,
        posts: &[PostDetails],
        integration: &Integration,
    ) -> Result<Vec<PostResponse>>;

    /// Engagement metrics for the last `days` days
    async fn analytics(
        &self,
        _id: &str,
        _access_token: &str,
        _days: u32,
    ) -> Result<Vec<AnalyticsData>> {
        Err(not_implemented(self.identifier(), "analytics"))
    }

    /// Accounts matching `query` for @-mention autocompletion
    async fn mention(
        &self,
        _access_token: &str,
        _query: &str,
        _integration: &Integration,
    ) -> Result<Vec<MentionCandidate>> {
        Ok(Vec::new())
    }

    /// Re-bind an existing integration to `requested_id` without a new
    /// authorization round trip
    async fn re_connect(
        &self,
        _id: &str,
        _requested_id: &str,
        _access_token: &str,
    ) -> Result<AuthTokenDetails> {
        Err(not_implemented(self.identifier(), "reconnect"))
    }

    /// Returns the name now shown on the network
    async fn change_nickname(&self, _id: &str, _access_token: &str, _name: &str) -> Result<String> {
        Err(not_implemented(self.identifier(), "nickname changes"))
    }

    /// Returns the URL of the new picture
    async fn change_profile_picture(
        &self,
        _id: &str,
        _access_token: &str,
        _url: &str,
    ) -> Result<String> {
        Err(not_implemented(self.identifier(), "profile picture changes"))
    }

    /// Classify a raw vendor error body
    fn handle_errors(&self, _body: &str) -> Option<HandledError> {
        None
    }

    /// Repost `post_id` once it has at least `min_likes` likes
    ///
    /// `Ok(false)` means the threshold was not reached yet.
    async fn auto_repost_post(
        &self,
        _integration: &Integration,
        _post_id: &str,
        _min_likes: u64,
    ) -> Result<bool> {
        Err(not_implemented(self.identifier(), "auto repost"))
    }

    /// Reply to `post_id` with `message` once it has at least `min_likes` likes
    ///
    /// `Ok(false)` means the threshold was not reached yet.
    async fn auto_plug_post(
        &self,
        _integration: &Integration,
        _post_id: &str,
        _min_likes: u64,
        _message: &str,
    ) -> Result<bool> {
        Err(not_implemented(self.identifier(), "auto plug"))
    }
}

fn not_implemented(identifier: &str, capability: &str) -> crate::error::PostgridError {
    ProviderError::NotImplemented(format!("{} does not support {}", identifier, capability)).into()
}

/// Close out a chain post
///
/// Once any item is live, a provider failure is wrapped in
/// [`ProviderError::Partial`] so the caller records what was published and
/// never replays it.
pub(crate) fn finish_chain(
    responses: Vec<PostResponse>,
    result: Result<()>,
) -> Result<Vec<PostResponse>> {
    match result {
        Ok(()) => Ok(responses),
        Err(e) if responses.is_empty() => Err(e),
        Err(crate::error::PostgridError::Provider(source)) => Err(ProviderError::Partial {
            published: responses,
            source: Box::new(source),
        }
        .into()),
        Err(e) => Err(e),
    }
}

/// Strip HTML tags the editor may leave in plain-text messages
pub(crate) fn strip_html(message: &str) -> String {
    use std::sync::OnceLock;

    static TAGS: OnceLock<regex::Regex> = OnceLock::new();
    let tags = TAGS.get_or_init(|| regex::Regex::new(r"<[^>]*>").expect("Valid regex"));
    tags.replace_all(message, "").to_string()
}
