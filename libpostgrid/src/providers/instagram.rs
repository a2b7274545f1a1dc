//! Instagram adapter (Instagram Login for professional accounts)
//!
//! Publishing is a three step process: create a media container, wait for
//! it to be processed, then publish it. Items after the first are posted as
//! comments on the published media.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use reqwest::Url;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use super::http::{
    check_scopes, make_id, OAuthApp, PollPolicy, ProviderHttp, STATE_LENGTH, VERIFIER_LENGTH,
};
use super::meta::{classify_graph, insights_to_analytics, wait_for_container};
use super::{finish_chain, strip_html, SocialProvider};
use crate::error::{PostgridError, ProviderError, Result};
use crate::types::{
    AnalyticsData, AuthTokenDetails, AuthenticateParams, GenerateAuthUrlResponse, HandledError,
    Integration, MediaContent, PostDetails, PostResponse,
};

pub const IDENTIFIER: &str = "instagram";

const SCOPES: &[&str] = &[
    "instagram_business_basic",
    "instagram_business_content_publish",
    "instagram_business_manage_comments",
    "instagram_business_manage_insights",
];
const GRAPH_VERSION: &str = "v21.0";
const DEFAULT_GRAPH_URL: &str = "https://graph.instagram.com";
const DEFAULT_API_URL: &str = "https://api.instagram.com";
const DEFAULT_AUTHORIZE_URL: &str = "https://www.instagram.com/oauth/authorize";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstagramPostType {
    #[default]
    Post,
    Story,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstagramSettings {
    #[serde(default)]
    pub post_type: InstagramPostType,
    /// Usernames to invite as collaborators
    #[serde(default)]
    pub collaborators: Vec<String>,
}

pub struct InstagramProvider {
    app: OAuthApp,
    http: ProviderHttp,
    graph_url: String,
    api_url: String,
    authorize_url: String,
    poll: PollPolicy,
}

#[derive(Deserialize)]
struct ShortLivedToken {
    access_token: String,
    #[serde(default)]
    permissions: Value,
}

#[derive(Deserialize)]
struct LongLivedToken {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct Me {
    #[serde(default)]
    user_id: Option<String>,
    id: String,
    username: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    profile_picture_url: Option<String>,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct Permalink {
    #[serde(default)]
    permalink: Option<String>,
}

#[derive(Deserialize)]
struct Insights {
    #[serde(default)]
    data: Vec<Value>,
}

/// Instagram reports permissions either as an array or a comma separated string
fn permissions_to_scope(permissions: &Value) -> String {
    match permissions {
        Value::Array(items) => items
            .iter()
            .filter_map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(","),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

pub fn classify(body: &str) -> Option<HandledError> {
    classify_graph(body)
}

impl InstagramProvider {
    pub fn new(app: OAuthApp, http: ProviderHttp) -> Self {
        Self {
            app,
            http,
            graph_url: DEFAULT_GRAPH_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            poll: PollPolicy::new(Duration::from_secs(3), 60),
        }
    }

    /// Point the Graph and OAuth APIs at `url`
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.graph_url = url.clone();
        self.api_url = url;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn graph(&self, path: &str) -> String {
        format!(
            "{}/{}{}",
            self.graph_url.trim_end_matches('/'),
            GRAPH_VERSION,
            path
        )
    }

    fn graph_root(&self, path: &str) -> String {
        format!("{}{}", self.graph_url.trim_end_matches('/'), path)
    }

    async fn profile(&self, access_token: &str, expires_in: Option<i64>) -> Result<AuthTokenDetails> {
        let request = self.http.client().get(self.graph("/me")).query(&[
            ("fields", "user_id,username,name,profile_picture_url"),
            ("access_token", access_token),
        ]);
        let me: Me = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok(AuthTokenDetails {
            id: me.user_id.unwrap_or(me.id),
            name: me.name.filter(|n| !n.is_empty()).unwrap_or_else(|| me.username.clone()),
            access_token: access_token.to_string(),
            // Long-lived tokens refresh themselves
            refresh_token: Some(access_token.to_string()),
            expires_in,
            picture: me.profile_picture_url,
            username: me.username,
            additional_settings: None,
        })
    }

    async fn create_container(&self, id: &str, access_token: &str, form: Vec<(&str, String)>) -> Result<String> {
        let mut form = form;
        form.push(("access_token", access_token.to_string()));
        let request = self
            .http
            .client()
            .post(self.graph(&format!("/{}/media", id)))
            .form(&form);
        let created: Created = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        wait_for_container(
            &self.http,
            IDENTIFIER,
            &self.graph(&format!("/{}", created.id)),
            access_token,
            "status_code",
            self.poll,
            classify,
        )
        .await?;
        Ok(created.id)
    }

    fn media_fields(media: &MediaContent, single_type: &str) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if media.is_video() {
            fields.push(("media_type", single_type.to_string()));
            fields.push(("video_url", media.path.clone()));
            if let Some(offset) = media.thumbnail_timestamp {
                fields.push(("thumb_offset", offset.to_string()));
            }
            if let Some(cover) = &media.thumbnail {
                fields.push(("cover_url", cover.clone()));
            }
        } else {
            if single_type == "STORIES" {
                fields.push(("media_type", "STORIES".to_string()));
            }
            fields.push(("image_url", media.path.clone()));
        }
        fields
    }

    async fn publish_first(&self, id: &str, access_token: &str, post: &PostDetails) -> Result<String> {
        let settings: InstagramSettings = post.settings()?;
        let caption = strip_html(&post.message);
        let is_story = settings.post_type == InstagramPostType::Story;

        let container = match post.media.as_slice() {
            [] => {
                return Err(ProviderError::Validation(
                    "Instagram posts need at least one image or video".to_string(),
                )
                .into())
            }
            [single] => {
                let kind = if is_story { "STORIES" } else { "REELS" };
                let mut form = Self::media_fields(single, kind);
                if !is_story {
                    form.push(("caption", caption));
                }
                if !settings.collaborators.is_empty() {
                    form.push(("collaborators", serde_json::to_string(&settings.collaborators).unwrap_or_default()));
                }
                self.create_container(id, access_token, form).await?
            }
            many => {
                let children = try_join_all(many.iter().map(|media| {
                    let mut form = Self::media_fields(media, "VIDEO");
                    form.push(("is_carousel_item", "true".to_string()));
                    self.create_container(id, access_token, form)
                }))
                .await?;
                self.create_container(
                    id,
                    access_token,
                    vec![
                        ("media_type", "CAROUSEL".to_string()),
                        ("children", children.join(",")),
                        ("caption", caption),
                    ],
                )
                .await?
            }
        };

        let request = self
            .http
            .client()
            .post(self.graph(&format!("/{}/media_publish", id)))
            .form(&[("creation_id", container.as_str()), ("access_token", access_token)]);
        let published: Created = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        Ok(published.id)
    }
}

#[async_trait]
impl SocialProvider for InstagramProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "Instagram"
    }

    fn scopes(&self) -> &[&'static str] {
        SCOPES
    }

    fn max_concurrent_job(&self) -> usize {
        10
    }

    fn max_length(&self, _additional_settings: &Value) -> usize {
        2200
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("enable_fb_login", "0"),
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri(IDENTIFIER).as_str()),
                ("response_type", "code"),
                ("scope", SCOPES.join(",").as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| ProviderError::Validation(format!("Invalid Instagram URL: {}", e)))?;

        Ok(GenerateAuthUrlResponse {
            url: url.to_string(),
            code_verifier: make_id(VERIFIER_LENGTH),
            state,
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        let redirect_uri = self.app.redirect_uri(IDENTIFIER);
        let request = self
            .http
            .client()
            .post(format!("{}/oauth/access_token", self.api_url.trim_end_matches('/')))
            .form(&[
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.expose_secret()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri.as_str()),
                ("code", params.code.as_str()),
            ]);
        let short: ShortLivedToken = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        check_scopes(SCOPES, &permissions_to_scope(&short.permissions))?;

        let request = self.http.client().get(self.graph_root("/access_token")).query(&[
            ("grant_type", "ig_exchange_token"),
            ("client_secret", self.app.client_secret.expose_secret()),
            ("access_token", short.access_token.as_str()),
        ]);
        let long: LongLivedToken = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        self.profile(&long.access_token, long.expires_in).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        let request = self
            .http
            .client()
            .get(self.graph_root("/refresh_access_token"))
            .query(&[
                ("grant_type", "ig_refresh_token"),
                ("access_token", refresh_token),
            ]);
        let long: LongLivedToken = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        self.profile(&long.access_token, long.expires_in).await
    }

    async fn post(
        &self,
        id: &str,
        access_token: &str,
        posts: &[PostDetails],
        _integration: &Integration,
    ) -> Result<Vec<PostResponse>> {
        let Some((first, comments)) = posts.split_first() else {
            return Ok(Vec::new());
        };

        let media_id = self.publish_first(id, access_token, first).await?;
        info!(media_id = %media_id, "Published to Instagram");

        let request = self
            .http
            .client()
            .get(self.graph(&format!("/{}", media_id)))
            .query(&[("fields", "permalink"), ("access_token", access_token)]);
        let permalink: Permalink = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        let release_url = permalink.permalink.unwrap_or_default();

        let mut responses = vec![PostResponse::posted(&first.id, &media_id, &release_url)];
        let result = async {
            for comment in comments {
                let message = strip_html(&comment.message);
                let request = self
                    .http
                    .client()
                    .post(self.graph(&format!("/{}/comments", media_id)))
                    .form(&[("message", message.as_str()), ("access_token", access_token)]);
                let created: Created = self
                    .http
                    .fetch(IDENTIFIER, request, classify)
                    .await?
                    .json()
                    .await?;
                responses.push(PostResponse::posted(&comment.id, created.id, &release_url));
            }
            Ok::<_, PostgridError>(())
        }
        .await;

        finish_chain(responses, result)
    }

    async fn analytics(&self, id: &str, access_token: &str, days: u32) -> Result<Vec<AnalyticsData>> {
        let until = Utc::now().timestamp();
        let since = until - i64::from(days) * 24 * 60 * 60;
        let request = self
            .http
            .client()
            .get(self.graph(&format!("/{}/insights", id)))
            .query(&[
                ("metric", "reach,follower_count".to_string()),
                ("period", "day".to_string()),
                ("since", since.to_string()),
                ("until", until.to_string()),
                ("access_token", access_token.to_string()),
            ]);
        let insights: Insights = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        Ok(insights_to_analytics(&insights.data))
    }

    fn handle_errors(&self, body: &str) -> Option<HandledError> {
        classify(body)
    }
}
