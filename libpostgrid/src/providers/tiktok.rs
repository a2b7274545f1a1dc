//! TikTok adapter (Content Posting API)
//!
//! TikTok pulls media from a public URL. Publishing starts a job that is
//! polled until the video is public or has been delivered to the creator's
//! inbox for manual completion.

use async_trait::async_trait;
use reqwest::Url;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use super::http::{
    check_scopes, make_id, poll_until, OAuthApp, PollPolicy, PollState, ProviderHttp,
    STATE_LENGTH, VERIFIER_LENGTH,
};
use super::{strip_html, SocialProvider};
use crate::error::{ProviderError, Result};
use crate::types::{
    AuthTokenDetails, AuthenticateParams, GenerateAuthUrlResponse, HandledError, HandledErrorKind,
    Integration, PostDetails, PostResponse,
};

pub const IDENTIFIER: &str = "tiktok";

const SCOPES: &[&str] = &[
    "user.info.basic",
    "user.info.profile",
    "video.publish",
    "video.upload",
];
const DEFAULT_API_URL: &str = "https://open.tiktokapis.com";
const DEFAULT_AUTHORIZE_URL: &str = "https://www.tiktok.com/v2/auth/authorize/";

/// Vendor error codes, checked in order
const ERRORS: &[(&str, HandledErrorKind, &str)] = &[
    ("access_token_invalid", HandledErrorKind::RefreshToken, "Access token invalid, please re-authenticate your TikTok account"),
    ("scope_not_authorized", HandledErrorKind::RefreshToken, "Missing required permissions, please re-authenticate with all scopes"),
    ("scope_permission_missed", HandledErrorKind::RefreshToken, "Missing required permissions, please re-authenticate with all scopes"),
    ("internal_error", HandledErrorKind::Retry, "TikTok had an internal error, retrying"),
    ("spam_risk_too_many_posts", HandledErrorKind::BadBody, "Daily post limit reached, please try again tomorrow"),
    ("spam_risk_user_banned_from_posting", HandledErrorKind::BadBody, "This account is banned from posting"),
    ("spam_risk_text", HandledErrorKind::BadBody, "TikTok flagged the post text as spam"),
    ("spam_risk", HandledErrorKind::BadBody, "TikTok flagged the post as spam"),
    ("reached_active_user_cap", HandledErrorKind::BadBody, "Daily active user quota for this app was reached"),
    ("unaudited_client_can_only_post_to_private_accounts", HandledErrorKind::BadBody, "This app can only post privately until it is audited, choose a private privacy level"),
    ("privacy_level_option_mismatch", HandledErrorKind::BadBody, "The privacy level is not allowed for this account"),
    ("url_ownership_unverified", HandledErrorKind::BadBody, "The media domain must be verified with TikTok"),
    ("file_format_check_failed", HandledErrorKind::BadBody, "File format is invalid, please check the video specifications"),
    ("duration_check_failed", HandledErrorKind::BadBody, "Video duration is not supported"),
    ("frame_rate_check_failed", HandledErrorKind::BadBody, "Video frame rate is not supported"),
    ("picture_size_check_failed", HandledErrorKind::BadBody, "Picture size is not supported"),
    ("video_pull_failed", HandledErrorKind::BadBody, "TikTok could not download the video"),
    ("photo_pull_failed", HandledErrorKind::BadBody, "TikTok could not download the photo"),
    ("invalid_publish_id", HandledErrorKind::BadBody, "Publishing job not found"),
];

pub fn classify(body: &str) -> Option<HandledError> {
    ERRORS
        .iter()
        .find(|(code, _, _)| body.contains(code))
        .map(|(_, kind, message)| HandledError {
            kind: *kind,
            value: message.to_string(),
        })
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostingMethod {
    /// Publish straight to the profile
    #[default]
    DirectPost,
    /// Send to the creator's inbox to finish in the app
    Upload,
}

#[derive(Debug, Deserialize)]
pub struct TikTokSettings {
    #[serde(default = "default_privacy")]
    pub privacy_level: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub disable_duet: bool,
    #[serde(default)]
    pub disable_comment: bool,
    #[serde(default)]
    pub disable_stitch: bool,
    #[serde(default)]
    pub brand_content_toggle: bool,
    #[serde(default)]
    pub brand_organic_toggle: bool,
    #[serde(default)]
    pub content_posting_method: PostingMethod,
}

fn default_privacy() -> String {
    "PUBLIC_TO_EVERYONE".to_string()
}

impl Default for TikTokSettings {
    fn default() -> Self {
        Self {
            privacy_level: default_privacy(),
            title: None,
            disable_duet: false,
            disable_comment: false,
            disable_stitch: false,
            brand_content_toggle: false,
            brand_organic_toggle: false,
            content_posting_method: PostingMethod::DirectPost,
        }
    }
}

pub struct TikTokProvider {
    app: OAuthApp,
    http: ProviderHttp,
    api_url: String,
    authorize_url: String,
    poll: PollPolicy,
}

#[derive(Deserialize)]
struct Token {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    #[serde(default)]
    scope: String,
}

#[derive(Deserialize, Default)]
struct User {
    open_id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

impl TikTokProvider {
    pub fn new(app: OAuthApp, http: ProviderHttp) -> Self {
        Self {
            app,
            http,
            api_url: DEFAULT_API_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            poll: PollPolicy::new(Duration::from_secs(10), 60),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }

    /// TikTok reports some failures inside a 2xx envelope
    fn ensure_ok(&self, body: Value) -> Result<Value> {
        let code = body
            .pointer("/error/code")
            .and_then(|c| c.as_str())
            .unwrap_or("ok");
        if code == "ok" {
            return Ok(body);
        }

        let raw = body.to_string();
        let handled = classify(&raw);
        let message = handled
            .as_ref()
            .map(|h| h.value.clone())
            .or_else(|| {
                body.pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string())
            })
            .unwrap_or_default();

        Err(match handled.map(|h| h.kind) {
            Some(HandledErrorKind::RefreshToken) => ProviderError::RefreshToken {
                identifier: IDENTIFIER.to_string(),
                message,
                body: raw,
            },
            Some(HandledErrorKind::Retry) => ProviderError::RateLimit(message),
            _ => ProviderError::BadBody {
                identifier: IDENTIFIER.to_string(),
                message,
                body: raw,
                request: String::new(),
            },
        }
        .into())
    }

    async fn call(&self, path: &str, access_token: &str, body: &Value) -> Result<Value> {
        let request = self
            .http
            .client()
            .post(self.url(path))
            .bearer_auth(access_token)
            .json(body);
        let response: Value = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        self.ensure_ok(response)
    }

    async fn token(&self, form: &[(&str, &str)]) -> Result<AuthTokenDetails> {
        let request = self
            .http
            .client()
            .post(self.url("/v2/oauth/token/"))
            .form(form);
        let body: Value = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        let token: Token = serde_json::from_value(self.ensure_ok(body)?)
            .map_err(|e| ProviderError::Posting(format!("Unexpected TikTok token response: {}", e)))?;
        check_scopes(SCOPES, &token.scope)?;

        let request = self
            .http
            .client()
            .get(self.url("/v2/user/info/"))
            .query(&[("fields", "open_id,avatar_url,display_name,username")])
            .bearer_auth(&token.access_token);
        let body: Value = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        let body = self.ensure_ok(body)?;
        let user: User = body
            .pointer("/data/user")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProviderError::Posting(format!("Unexpected TikTok user response: {}", e)))?
            .unwrap_or_default();

        Ok(AuthTokenDetails {
            id: user.open_id,
            name: user.display_name,
            access_token: token.access_token,
            refresh_token: Some(token.refresh_token),
            expires_in: Some(token.expires_in),
            picture: user.avatar_url,
            username: user.username,
            additional_settings: None,
        })
    }

    fn init_request(post: &PostDetails, settings: &TikTokSettings) -> Result<(&'static str, Value)> {
        let caption = strip_html(&post.message);
        let direct = settings.content_posting_method == PostingMethod::DirectPost;
        let post_info = json!({
            "title": settings.title.clone().unwrap_or_else(|| caption.clone()),
            "description": caption,
            "privacy_level": settings.privacy_level,
            "disable_duet": settings.disable_duet,
            "disable_comment": settings.disable_comment,
            "disable_stitch": settings.disable_stitch,
            "brand_content_toggle": settings.brand_content_toggle,
            "brand_organic_toggle": settings.brand_organic_toggle,
        });

        match post.media.as_slice() {
            [] => Err(ProviderError::Validation(
                "TikTok posts need a video or at least one photo".to_string(),
            )
            .into()),
            [video] if video.is_video() => {
                let source_info = json!({"source": "PULL_FROM_URL", "video_url": video.path});
                if direct {
                    Ok((
                        "/v2/post/publish/video/init/",
                        json!({"post_info": post_info, "source_info": source_info}),
                    ))
                } else {
                    Ok((
                        "/v2/post/publish/inbox/video/init/",
                        json!({"source_info": source_info}),
                    ))
                }
            }
            media if media.iter().any(|m| m.is_video()) => Err(ProviderError::Validation(
                "TikTok posts take a single video or photos only".to_string(),
            )
            .into()),
            photos => Ok((
                "/v2/post/publish/content/init/",
                json!({
                    "post_info": post_info,
                    "source_info": {
                        "source": "PULL_FROM_URL",
                        "photo_cover_index": 0,
                        "photo_images": photos.iter().map(|p| p.path.as_str()).collect::<Vec<_>>(),
                    },
                    "post_mode": if direct { "DIRECT_POST" } else { "MEDIA_UPLOAD" },
                    "media_type": "PHOTO",
                }),
            )),
        }
    }

    /// Poll the publish job; returns the public post id when TikTok reports one
    async fn wait_for_publish(&self, access_token: &str, publish_id: &str) -> Result<Option<String>> {
        poll_until(IDENTIFIER, self.poll, || async move {
            let status = self
                .call(
                    "/v2/post/publish/status/fetch/",
                    access_token,
                    &json!({"publish_id": publish_id}),
                )
                .await?;
            let state = status
                .pointer("/data/status")
                .and_then(|s| s.as_str())
                .unwrap_or_default();

            Ok(match state {
                "PUBLISH_COMPLETE" => PollState::Done(
                    status
                        .pointer("/data/publicaly_available_post_id/0")
                        .map(|id| match id {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        }),
                ),
                "SEND_TO_USER_INBOX" => PollState::Done(None),
                "FAILED" => {
                    let reason = status
                        .pointer("/data/fail_reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("unknown");
                    PollState::Failed(
                        classify(reason)
                            .map(|h| h.value)
                            .unwrap_or_else(|| format!("TikTok rejected the post: {}", reason)),
                    )
                }
                _ => PollState::Pending,
            })
        })
        .await
    }
}

#[async_trait]
impl SocialProvider for TikTokProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "TikTok"
    }

    fn scopes(&self) -> &[&'static str] {
        SCOPES
    }

    fn max_concurrent_job(&self) -> usize {
        1
    }

    fn max_length(&self, _additional_settings: &Value) -> usize {
        2000
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("client_key", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri(IDENTIFIER).as_str()),
                ("response_type", "code"),
                ("scope", SCOPES.join(",").as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| ProviderError::Validation(format!("Invalid TikTok URL: {}", e)))?;

        Ok(GenerateAuthUrlResponse {
            url: url.to_string(),
            code_verifier: make_id(VERIFIER_LENGTH),
            state,
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        let redirect_uri = self.app.redirect_uri(IDENTIFIER);
        self.token(&[
            ("client_key", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
            ("code", params.code.as_str()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        self.token(&[
            ("client_key", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
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
        integration: &Integration,
    ) -> Result<Vec<PostResponse>> {
        let Some(post) = posts.first() else {
            return Ok(Vec::new());
        };
        if posts.len() > 1 {
            return Err(ProviderError::Validation(format!(
                "TikTok has no comment API; got {} items, only one can be published",
                posts.len()
            ))
            .into());
        }

        let settings: TikTokSettings = post.settings()?;
        let (path, body) = Self::init_request(post, &settings)?;
        let init = self.call(path, access_token, &body).await?;
        let publish_id = init
            .pointer("/data/publish_id")
            .and_then(|p| p.as_str())
            .ok_or_else(|| ProviderError::Posting("TikTok did not return a publish id".to_string()))?
            .to_string();
        info!(publish_id = %publish_id, "TikTok publish job started");

        let public_id = self.wait_for_publish(access_token, &publish_id).await?;
        let release_url = match &public_id {
            Some(video_id) => format!("https://www.tiktok.com/@{}/video/{}", integration.profile, video_id),
            None => String::new(),
        };

        Ok(vec![PostResponse::posted(
            &post.id,
            public_id.unwrap_or(publish_id),
            release_url,
        )])
    }

    fn handle_errors(&self, body: &str) -> Option<HandledError> {
        classify(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PostgridError;
    use crate::providers::RetryPolicy;
    use crate::types::MediaContent;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> TikTokProvider {
        let app = OAuthApp::new("tt-key", "tt-secret", "https://app.example.com");
        let http = ProviderHttp::new(RetryPolicy::new(1, Duration::from_millis(1)));
        TikTokProvider::new(app, http)
            .with_api_url(server.uri())
            .with_poll_policy(PollPolicy::new(Duration::from_millis(1), 5))
    }

    fn integration() -> Integration {
        Integration {
            profile: "studio".to_string(),
            ..Default::default()
        }
    }

    fn video_post() -> PostDetails {
        PostDetails::new("p1", "<p>New video</p>")
            .with_media(vec![MediaContent::video("https://cdn.example.com/v.mp4")])
    }

    #[test]
    fn test_classify() {
        let handled = classify(r#"{"error":{"code":"access_token_invalid"}}"#).unwrap();
        assert_eq!(handled.kind, HandledErrorKind::RefreshToken);

        let handled = classify(r#"{"error":{"code":"spam_risk_too_many_posts"}}"#).unwrap();
        assert_eq!(handled.kind, HandledErrorKind::BadBody);
        assert_eq!(handled.value, "Daily post limit reached, please try again tomorrow");

        assert!(classify(r#"{"error":{"code":"something_else"}}"#).is_none());
    }

    #[test]
    fn test_photo_init_request() {
        let post = PostDetails::new("p1", "two photos").with_media(vec![
            MediaContent::image("https://cdn/1.jpg"),
            MediaContent::image("https://cdn/2.jpg"),
        ]);
        let (path, body) = TikTokProvider::init_request(&post, &TikTokSettings::default()).unwrap();
        assert_eq!(path, "/v2/post/publish/content/init/");
        assert_eq!(body["media_type"], "PHOTO");
        assert_eq!(body["post_mode"], "DIRECT_POST");
        assert_eq!(body["source_info"]["photo_images"][1], "https://cdn/2.jpg");
    }

    #[test]
    fn test_mixed_media_rejected() {
        let post = PostDetails::new("p1", "mixed").with_media(vec![
            MediaContent::image("https://cdn/1.jpg"),
            MediaContent::video("https://cdn/2.mp4"),
        ]);
        assert!(TikTokProvider::init_request(&post, &TikTokSettings::default()).is_err());
    }

    #[tokio::test]
    async fn test_generate_auth_url() {
        let server = MockServer::start().await;
        let auth = provider(&server).generate_auth_url().unwrap();

        let url = Url::parse(&auth.url).unwrap();
        assert!(auth.url.starts_with(DEFAULT_AUTHORIZE_URL));
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["client_key"], "tt-key");
        assert_eq!(query["response_type"], "code");
        assert_eq!(
            query["redirect_uri"],
            "https://app.example.com/integrations/social/tiktok"
        );
        assert_eq!(query["scope"], SCOPES.join(","));
        assert_eq!(query["state"], auth.state);
    }

    #[tokio::test]
    async fn test_post_rejects_chains() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let posts = vec![video_post(), PostDetails::new("p2", "A reply")];
        let err = provider(&server)
            .post("open-1", "act", &posts, &integration())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PostgridError::Provider(ProviderError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/oauth/token/"))
            .and(body_string_contains("client_key=tt-key"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "act",
                "refresh_token": "rft",
                "expires_in": 86400,
                "open_id": "open-1",
                "scope": "user.info.basic,user.info.profile,video.publish,video.upload",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/user/info/"))
            .and(header("authorization", "Bearer act"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"user": {
                    "open_id": "open-1", "display_name": "Studio", "username": "studio",
                    "avatar_url": "https://cdn/avatar.jpg"
                }},
                "error": {"code": "ok", "message": ""}
            })))
            .mount(&server)
            .await;

        let details = provider(&server)
            .authenticate(&AuthenticateParams::code("abc"))
            .await
            .unwrap();
        assert_eq!(details.id, "open-1");
        assert_eq!(details.username, "studio");
        assert_eq!(details.refresh_token.as_deref(), Some("rft"));
    }

    #[tokio::test]
    async fn test_direct_video_post_polls_until_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .and(body_partial_json(json!({
                "post_info": {"title": "New video", "privacy_level": "PUBLIC_TO_EVERYONE"},
                "source_info": {"source": "PULL_FROM_URL", "video_url": "https://cdn.example.com/v.mp4"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"publish_id": "pub-1"}, "error": {"code": "ok"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "PROCESSING_DOWNLOAD"}, "error": {"code": "ok"}
            })))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "PUBLISH_COMPLETE", "publicaly_available_post_id": [7300000000001_i64]},
                "error": {"code": "ok"}
            })))
            .with_priority(2)
            .mount(&server)
            .await;

        let responses = provider(&server)
            .post("open-1", "act", &[video_post()], &integration())
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].post_id, "7300000000001");
        assert_eq!(
            responses[0].release_url,
            "https://www.tiktok.com/@studio/video/7300000000001"
        );
    }

    #[tokio::test]
    async fn test_inbox_upload_has_no_release_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/inbox/video/init/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"publish_id": "pub-2"}, "error": {"code": "ok"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "SEND_TO_USER_INBOX"}, "error": {"code": "ok"}
            })))
            .mount(&server)
            .await;

        let post = video_post().with_settings(json!({"content_posting_method": "UPLOAD"}));
        let responses = provider(&server)
            .post("open-1", "act", &[post], &integration())
            .await
            .unwrap();
        assert_eq!(responses[0].post_id, "pub-2");
        assert!(responses[0].release_url.is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_uses_classified_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"publish_id": "pub-3"}, "error": {"code": "ok"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/status/fetch/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "FAILED", "fail_reason": "duration_check_failed"},
                "error": {"code": "ok"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .post("open-1", "act", &[video_post()], &integration())
            .await
            .unwrap_err();
        match err {
            PostgridError::Provider(ProviderError::JobFailed { message, .. }) => {
                assert_eq!(message, "Video duration is not supported");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_error_envelope_requires_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/post/publish/video/init/"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "data": {},
                "error": {"code": "access_token_invalid", "message": "The access token is invalid"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .post("open-1", "act", &[video_post()], &integration())
            .await
            .unwrap_err();
        assert!(err.as_provider().is_some_and(|e| e.requires_reauthentication()));
    }
}
