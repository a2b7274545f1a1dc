//! Reddit adapter
//!
//! The first item is submitted to a subreddit; the rest are posted as a
//! chain of comments, each replying to the previous one.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Url};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::info;

use super::http::{
    check_scopes, make_id, no_classification, OAuthApp, ProviderHttp, STATE_LENGTH,
    VERIFIER_LENGTH,
};
use super::{finish_chain, strip_html, SocialProvider};
use crate::error::{PostgridError, ProviderError, Result};
use crate::types::{
    AuthTokenDetails, AuthenticateParams, GenerateAuthUrlResponse, Integration, PostDetails,
    PostResponse,
};

pub const IDENTIFIER: &str = "reddit";

const SCOPES: &[&str] = &["read", "identity", "submit", "flair"];
const DEFAULT_WWW_URL: &str = "https://www.reddit.com";
const DEFAULT_OAUTH_API_URL: &str = "https://oauth.reddit.com";
const USER_AGENT: &str = concat!("postgrid/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionKind {
    #[default]
    #[serde(alias = "text")]
    #[serde(rename = "self")]
    SelfPost,
    Link,
    /// Link to the first attached media file
    Media,
}

#[derive(Debug, Default, Deserialize)]
pub struct RedditSettings {
    pub subreddit: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub kind: SubmissionKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub flair_id: Option<String>,
}

pub struct RedditProvider {
    app: OAuthApp,
    http: ProviderHttp,
    www_url: String,
    api_url: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: String,
}

#[derive(Deserialize)]
struct Me {
    name: String,
    #[serde(default)]
    icon_img: Option<String>,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    json: ApiBody<T>,
}

#[derive(Deserialize)]
struct ApiBody<T> {
    #[serde(default)]
    errors: Vec<serde_json::Value>,
    data: Option<T>,
}

#[derive(Deserialize)]
struct Submitted {
    id: String,
    name: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct CommentThings {
    things: Vec<CommentThing>,
}

#[derive(Deserialize)]
struct CommentThing {
    data: Comment,
}

#[derive(Deserialize)]
struct Comment {
    id: String,
    name: String,
    #[serde(default)]
    permalink: String,
}

/// Reddit reports validation failures inside 200 responses
fn into_data<T>(body: ApiBody<T>, request: String) -> Result<T> {
    if !body.errors.is_empty() {
        let message = body
            .errors
            .iter()
            .map(|e| match e {
                serde_json::Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(": "),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ProviderError::BadBody {
            identifier: IDENTIFIER.to_string(),
            message,
            body: serde_json::to_string(&body.errors).unwrap_or_default(),
            request,
        }
        .into());
    }
    body.data.ok_or_else(|| {
        ProviderError::Posting("Reddit response did not contain data".to_string()).into()
    })
}

impl RedditProvider {
    pub fn new(app: OAuthApp, http: ProviderHttp) -> Self {
        Self {
            app,
            http,
            www_url: DEFAULT_WWW_URL.to_string(),
            api_url: DEFAULT_OAUTH_API_URL.to_string(),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.www_url = url.clone();
        self.api_url = url;
        self
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder {
        request
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
    }

    async fn exchange(&self, form: &[(&str, &str)]) -> Result<AuthTokenDetails> {
        let request = self
            .http
            .client()
            .post(format!(
                "{}/api/v1/access_token",
                self.www_url.trim_end_matches('/')
            ))
            .basic_auth(
                &self.app.client_id,
                Some(self.app.client_secret.expose_secret()),
            )
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .form(form);
        let token: TokenResponse = self
            .http
            .fetch(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?;

        check_scopes(SCOPES, &token.scope)?;

        let request = self.authorized(self.http.client().get(self.api("/api/v1/me")), &token.access_token);
        let me: Me = self
            .http
            .fetch(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?;

        Ok(AuthTokenDetails {
            id: me.name.clone(),
            name: me.name.clone(),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
            picture: me
                .icon_img
                .map(|icon| icon.split('?').next().unwrap_or_default().to_string()),
            username: me.name,
            additional_settings: None,
        })
    }

    async fn submit(&self, access_token: &str, post: &PostDetails) -> Result<Submitted> {
        let settings: RedditSettings = post.settings()?;
        if settings.subreddit.is_empty() {
            return Err(ProviderError::Validation("Reddit posts need a subreddit".to_string()).into());
        }

        let text = strip_html(&post.message);
        let title = if settings.title.is_empty() {
            text.lines().next().unwrap_or_default().to_string()
        } else {
            settings.title.clone()
        };
        let mut form: Vec<(&str, String)> = vec![
            ("api_type", "json".to_string()),
            ("sr", settings.subreddit.trim_start_matches("r/").to_string()),
            ("title", title),
            ("resubmit", "true".to_string()),
            ("sendreplies", "true".to_string()),
        ];
        match settings.kind {
            SubmissionKind::SelfPost => {
                form.push(("kind", "self".to_string()));
                form.push(("text", text));
            }
            SubmissionKind::Link => {
                let url = settings.url.clone().ok_or_else(|| {
                    ProviderError::Validation("Reddit link posts need a url".to_string())
                })?;
                form.push(("kind", "link".to_string()));
                form.push(("url", url));
            }
            SubmissionKind::Media => {
                let media = post.media.first().ok_or_else(|| {
                    ProviderError::Validation("Reddit media posts need an attachment".to_string())
                })?;
                form.push(("kind", "link".to_string()));
                form.push(("url", media.path.clone()));
            }
        }
        if let Some(flair) = settings.flair_id {
            form.push(("flair_id", flair));
        }

        let request = self.authorized(self.http.client().post(self.api("/api/submit")), access_token);
        let envelope: ApiEnvelope<Submitted> = self
            .http
            .fetch(IDENTIFIER, request.form(&form), no_classification)
            .await?
            .json()
            .await?;
        into_data(envelope.json, form_summary(&form))
    }

    async fn comment(&self, access_token: &str, parent: &str, text: &str) -> Result<Comment> {
        let form = [
            ("api_type", "json".to_string()),
            ("thing_id", parent.to_string()),
            ("text", text.to_string()),
        ];
        let request = self.authorized(self.http.client().post(self.api("/api/comment")), access_token);
        let envelope: ApiEnvelope<CommentThings> = self
            .http
            .fetch(IDENTIFIER, request.form(&form), no_classification)
            .await?
            .json()
            .await?;
        into_data(envelope.json, form_summary(&form))?
            .things
            .into_iter()
            .next()
            .map(|thing| thing.data)
            .ok_or_else(|| ProviderError::Posting("Reddit did not return the comment".to_string()).into())
    }
}

fn form_summary(form: &[(&str, String)]) -> String {
    form.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[async_trait]
impl SocialProvider for RedditProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "Reddit"
    }

    fn scopes(&self) -> &[&'static str] {
        SCOPES
    }

    fn max_concurrent_job(&self) -> usize {
        1
    }

    fn max_length(&self, _additional_settings: &serde_json::Value) -> usize {
        10000
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        let url = Url::parse_with_params(
            &format!("{}/api/v1/authorize", self.www_url.trim_end_matches('/')),
            &[
                ("client_id", self.app.client_id.as_str()),
                ("response_type", "code"),
                ("state", state.as_str()),
                ("redirect_uri", self.app.redirect_uri(IDENTIFIER).as_str()),
                ("duration", "permanent"),
                ("scope", SCOPES.join(" ").as_str()),
            ],
        )
        .map_err(|e| ProviderError::Validation(format!("Invalid Reddit URL: {}", e)))?;

        Ok(GenerateAuthUrlResponse {
            url: url.to_string(),
            code_verifier: make_id(VERIFIER_LENGTH),
            state,
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        let redirect_uri = self.app.redirect_uri(IDENTIFIER);
        self.exchange(&[
            ("grant_type", "authorization_code"),
            ("code", params.code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        self.exchange(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn post(
        &self,
        _id: &str,
        access_token: &str,
        posts: &[PostDetails],
        _integration: &Integration,
    ) -> Result<Vec<PostResponse>> {
        let Some((first, comments)) = posts.split_first() else {
            return Ok(Vec::new());
        };

        let submitted = self.submit(access_token, first).await?;
        info!(post_id = %submitted.id, "Submitted to Reddit");
        let release_url = submitted
            .url
            .clone()
            .unwrap_or_else(|| format!("https://www.reddit.com/comments/{}", submitted.id));
        let mut responses = vec![PostResponse::posted(&first.id, &submitted.id, release_url)];

        let result = async {
            let mut parent = submitted.name;
            for item in comments {
                let comment = self
                    .comment(access_token, &parent, &strip_html(&item.message))
                    .await?;
                responses.push(PostResponse::posted(
                    &item.id,
                    &comment.id,
                    format!("https://www.reddit.com{}", comment.permalink),
                ));
                parent = comment.name;
            }
            Ok::<_, PostgridError>(())
        }
        .await;

        finish_chain(responses, result)
    }
}
