//! Mastodon adapter
//!
//! Talks to the Mastodon REST API of the configured instance. Statuses of
//! a chain are linked with `in_reply_to_id`. Mastodon tokens do not expire,
//! so refresh is not supported.

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use super::http::{
    check_scopes, make_id, no_classification, poll_until, OAuthApp, PollPolicy, PollState,
    ProviderHttp, STATE_LENGTH, VERIFIER_LENGTH,
};
use super::{finish_chain, strip_html, SocialProvider};
use crate::error::{PostgridError, ProviderError, Result};
use crate::types::{
    AuthTokenDetails, AuthenticateParams, GenerateAuthUrlResponse, Integration, MediaContent,
    PostDetails, PostResponse,
};

pub const IDENTIFIER: &str = "mastodon";

const SCOPES: &[&str] = &["write:statuses", "profile", "write:media"];
pub const DEFAULT_INSTANCE: &str = "https://mastodon.social";

#[derive(Debug, Default, Deserialize)]
pub struct MastodonSettings {
    /// `public`, `unlisted`, `private` or `direct`
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub spoiler_text: Option<String>,
}

pub struct MastodonProvider {
    app: OAuthApp,
    http: ProviderHttp,
    instance: String,
    poll: PollPolicy,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    scope: String,
}

#[derive(Deserialize)]
struct Account {
    id: String,
    #[serde(default)]
    display_name: String,
    acct: String,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Deserialize)]
struct Status {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct Attachment {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

impl MastodonProvider {
    pub fn new(app: OAuthApp, http: ProviderHttp, instance: impl Into<String>) -> Self {
        Self {
            app,
            http,
            instance: instance.into(),
            poll: PollPolicy::new(Duration::from_secs(1), 30),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.instance.trim_end_matches('/'), path)
    }

    async fn verify_credentials(&self, access_token: &str) -> Result<Account> {
        let request = self
            .http
            .client()
            .get(self.url("/api/v1/accounts/verify_credentials"))
            .bearer_auth(access_token);
        Ok(self
            .http
            .fetch(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?)
    }

    async fn upload_media(&self, access_token: &str, media: &MediaContent) -> Result<String> {
        let file = self.http.download(&media.path).await?;
        let part = Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.content_type)
            .map_err(|e| ProviderError::Validation(format!("Invalid media type: {}", e)))?;
        let mut form = Form::new().part("file", part);
        if let Some(alt) = &media.alt {
            form = form.text("description", alt.clone());
        }

        let request = self
            .http
            .client()
            .post(self.url("/api/v2/media"))
            .bearer_auth(access_token)
            .multipart(form);
        let response = self
            .http
            .fetch_once(IDENTIFIER, request, no_classification)
            .await?;
        let processing = response.status() == reqwest::StatusCode::ACCEPTED;
        let attachment: Attachment = response.json().await?;

        if processing || attachment.url.is_none() {
            debug!(media_id = %attachment.id, "Waiting for Mastodon media processing");
            let id = attachment.id.as_str();
            poll_until(IDENTIFIER, self.poll, || async move {
                let request = self
                    .http
                    .client()
                    .get(self.url(&format!("/api/v1/media/{}", id)))
                    .bearer_auth(access_token);
                let response = self
                    .http
                    .fetch(IDENTIFIER, request, no_classification)
                    .await?;
                if response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
                    return Ok(PollState::Pending);
                }
                let current: Attachment = response.json().await?;
                Ok(match current.url {
                    Some(_) => PollState::Done(()),
                    None => PollState::Pending,
                })
            })
            .await?;
        }

        Ok(attachment.id)
    }
}

#[async_trait]
impl SocialProvider for MastodonProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "Mastodon"
    }

    fn scopes(&self) -> &[&'static str] {
        SCOPES
    }

    fn max_concurrent_job(&self) -> usize {
        5
    }

    fn max_length(&self, _additional_settings: &serde_json::Value) -> usize {
        500
    }

    fn supports_refresh(&self) -> bool {
        false
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        let url = Url::parse_with_params(
            &self.url("/oauth/authorize"),
            &[
                ("client_id", self.app.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.app.redirect_uri(IDENTIFIER).as_str()),
                ("scope", SCOPES.join(" ").as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| ProviderError::Validation(format!("Invalid Mastodon instance URL: {}", e)))?;

        Ok(GenerateAuthUrlResponse {
            url: url.to_string(),
            code_verifier: make_id(VERIFIER_LENGTH),
            state,
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        let redirect_uri = self.app.redirect_uri(IDENTIFIER);
        let scope = SCOPES.join(" ");
        let request = self.http.client().post(self.url("/oauth/token")).form(&[
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
            ("grant_type", "authorization_code"),
            ("code", params.code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", scope.as_str()),
        ]);
        let token: TokenResponse = self
            .http
            .fetch(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?;
        check_scopes(SCOPES, &token.scope)?;

        let account = self.verify_credentials(&token.access_token).await?;
        Ok(AuthTokenDetails {
            id: account.id,
            name: if account.display_name.is_empty() {
                account.acct.clone()
            } else {
                account.display_name
            },
            access_token: token.access_token,
            refresh_token: None,
            expires_in: None,
            picture: account.avatar,
            username: account.acct,
            additional_settings: None,
        })
    }

    async fn post(
        &self,
        _id: &str,
        access_token: &str,
        posts: &[PostDetails],
        _integration: &Integration,
    ) -> Result<Vec<PostResponse>> {
        let mut responses = Vec::with_capacity(posts.len());
        let mut reply_to: Option<String> = None;

        let result = async {
            for post in posts {
                let settings: MastodonSettings = post.settings()?;
                let media_ids = try_join_all(
                    post.media
                        .iter()
                        .map(|media| self.upload_media(access_token, media)),
                )
                .await?;

                let mut body = json!({
                    "status": strip_html(&post.message),
                    "visibility": settings.visibility.as_deref().unwrap_or("public"),
                    "media_ids": media_ids,
                });
                if let Some(previous) = &reply_to {
                    body["in_reply_to_id"] = json!(previous);
                }
                if let Some(spoiler) = settings.spoiler_text.filter(|s| !s.is_empty()) {
                    body["spoiler_text"] = json!(spoiler);
                }

                let request = self
                    .http
                    .client()
                    .post(self.url("/api/v1/statuses"))
                    .bearer_auth(access_token)
                    .header("Idempotency-Key", format!("{}-{}", post.id, responses.len()))
                    .json(&body);
                let status: Status = self
                    .http
                    .fetch(IDENTIFIER, request, no_classification)
                    .await?
                    .json()
                    .await?;

                info!(status_id = %status.id, "Published to Mastodon");
                let release_url = status
                    .url
                    .unwrap_or_else(|| self.url(&format!("/statuses/{}", status.id)));
                responses.push(PostResponse::posted(&post.id, &status.id, release_url));
                reply_to = Some(status.id);
            }
            Ok::<_, PostgridError>(())
        }
        .await;

        finish_chain(responses, result)
    }

    async fn change_nickname(&self, _id: &str, access_token: &str, name: &str) -> Result<String> {
        let request = self
            .http
            .client()
            .patch(self.url("/api/v1/accounts/update_credentials"))
            .bearer_auth(access_token)
            .form(&[("display_name", name)]);
        let account: Account = self
            .http
            .fetch(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?;
        Ok(account.display_name)
    }

    async fn change_profile_picture(
        &self,
        _id: &str,
        access_token: &str,
        url: &str,
    ) -> Result<String> {
        let file = self.http.download(url).await?;
        let part = Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.content_type)
            .map_err(|e| ProviderError::Validation(format!("Invalid media type: {}", e)))?;
        let request = self
            .http
            .client()
            .patch(self.url("/api/v1/accounts/update_credentials"))
            .bearer_auth(access_token)
            .multipart(Form::new().part("avatar", part));
        let account: Account = self
            .http
            .fetch_once(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?;
        Ok(account.avatar.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PostgridError;
    use crate::providers::http::RetryPolicy;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> MastodonProvider {
        let app = OAuthApp::new("md-client", "md-secret", "https://app.example.com");
        let http = ProviderHttp::new(RetryPolicy::new(0, Duration::from_millis(1)));
        MastodonProvider::new(app, http, server.uri())
            .with_poll_policy(PollPolicy::new(Duration::from_millis(1), 5))
    }

    #[tokio::test]
    async fn test_generate_auth_url_targets_instance() {
        let server = MockServer::start().await;
        let auth = provider(&server).generate_auth_url().unwrap();
        assert!(auth.url.starts_with(&format!("{}/oauth/authorize?", server.uri())));
        assert!(auth.url.contains("client_id=md-client"));
        assert_eq!(auth.state.len(), 16);
    }

    #[tokio::test]
    async fn test_authenticate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "md-access",
                "token_type": "Bearer",
                "scope": "write:statuses profile write:media"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/accounts/verify_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "109",
                "display_name": "",
                "acct": "gargron",
                "avatar": "https://files.example/avatar.png"
            })))
            .mount(&server)
            .await;

        let mastodon = provider(&server);
        let details = mastodon
            .authenticate(&AuthenticateParams::code("code"))
            .await
            .unwrap();
        assert_eq!(details.id, "109");
        assert_eq!(details.name, "gargron");
        assert!(details.refresh_token.is_none());
        assert!(!mastodon.supports_refresh());
    }

    #[tokio::test]
    async fn test_refresh_is_not_supported() {
        let server = MockServer::start().await;
        let err = provider(&server).refresh_token("x").await.unwrap_err();
        assert!(matches!(
            err,
            PostgridError::Provider(ProviderError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_post_chains_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/statuses"))
            .and(body_partial_json(json!({"status": "one", "visibility": "unlisted"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "1", "url": "https://mastodon.example/@me/1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/statuses"))
            .and(body_partial_json(json!({"status": "two", "in_reply_to_id": "1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "2", "url": "https://mastodon.example/@me/2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let posts = vec![
            PostDetails::new("a", "one").with_settings(json!({"visibility": "unlisted"})),
            PostDetails::new("b", "two"),
        ];
        let responses = provider(&server)
            .post("109", "md-access", &posts, &Integration::default())
            .await
            .unwrap();
        assert_eq!(responses[0].post_id, "1");
        assert_eq!(responses[1].post_id, "2");
        assert_eq!(responses[1].release_url, "https://mastodon.example/@me/2");
    }

    #[tokio::test]
    async fn test_post_failing_midway_reports_published_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/statuses"))
            .and(body_partial_json(json!({"status": "one"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "1", "url": "https://mastodon.example/@me/1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/statuses"))
            .and(body_partial_json(json!({"status": "two"})))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let posts = vec![PostDetails::new("a", "one"), PostDetails::new("b", "two")];
        let err = provider(&server)
            .post("109", "md-access", &posts, &Integration::default())
            .await
            .unwrap_err();

        match err {
            PostgridError::Provider(ProviderError::Partial { published, .. }) => {
                assert_eq!(published.len(), 1);
                assert_eq!(published[0].id, "a");
                assert_eq!(published[0].post_id, "1");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_waits_for_async_media() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cdn/pic.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 10]))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/media"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"id": "m9", "url": null})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/media/m9"))
            .respond_with(ResponseTemplate::new(206).set_body_json(json!({"id": "m9", "url": null})))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/media/m9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m9", "url": "https://files.example/m9.jpg"
            })))
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/statuses"))
            .and(body_partial_json(json!({"media_ids": ["m9"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "5"})))
            .expect(1)
            .mount(&server)
            .await;

        let post = PostDetails::new("a", "pic")
            .with_media(vec![MediaContent::image(format!("{}/cdn/pic.jpg", server.uri()))]);
        let responses = provider(&server)
            .post("109", "md-access", &[post], &Integration::default())
            .await
            .unwrap();
        assert_eq!(responses[0].post_id, "5");
        assert_eq!(
            responses[0].release_url,
            format!("{}/statuses/5", server.uri())
        );
    }

    #[tokio::test]
    async fn test_change_nickname() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/accounts/update_credentials"))
            .and(body_string_contains("display_name=New+Name"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "109", "display_name": "New Name", "acct": "gargron"
            })))
            .mount(&server)
            .await;

        let name = provider(&server)
            .change_nickname("109", "md-access", "New Name")
            .await
            .unwrap();
        assert_eq!(name, "New Name");
    }
}
