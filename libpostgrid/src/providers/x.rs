//! X (Twitter) adapter
//!
//! OAuth 2.0 with PKCE, v2 tweets and the v2 chunked media upload. Threads
//! are built by replying to the previous tweet of the chain.

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
    check_scopes, make_id, pkce_challenge, poll_until, OAuthApp, PollPolicy, PollState,
    ProviderHttp, STATE_LENGTH, VERIFIER_LENGTH,
};
use super::{finish_chain, strip_html, SocialProvider};
use crate::error::{PostgridError, ProviderError, Result};
use crate::types::{
    AuthTokenDetails, AuthenticateParams, GenerateAuthUrlResponse, HandledError, Integration,
    MediaContent, MentionCandidate, PostDetails, PostResponse,
};

pub const IDENTIFIER: &str = "x";

const SCOPES: &[&str] = &[
    "tweet.read",
    "tweet.write",
    "users.read",
    "offline.access",
    "media.write",
];

const DEFAULT_API_URL: &str = "https://api.x.com";
const DEFAULT_AUTHORIZE_URL: &str = "https://x.com/i/oauth2/authorize";
const UPLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Per-post settings
#[derive(Debug, Default, Deserialize)]
pub struct XSettings {
    /// `everyone`, `following`, `mentionedUsers` or `subscribers`
    #[serde(default)]
    pub who_can_reply_post: Option<String>,
    /// Community URL or id to post into
    #[serde(default)]
    pub community: Option<String>,
}

pub struct XProvider {
    app: OAuthApp,
    http: ProviderHttp,
    api_url: String,
    authorize_url: String,
    poll: PollPolicy,
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
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct User {
    id: String,
    name: String,
    username: String,
    #[serde(default)]
    profile_image_url: Option<String>,
    #[serde(default)]
    verified: bool,
}

#[derive(Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Deserialize)]
struct Tweet {
    public_metrics: PublicMetrics,
}

#[derive(Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    like_count: u64,
}

#[derive(Deserialize)]
struct UploadedMedia {
    id: String,
    #[serde(default)]
    processing_info: Option<ProcessingInfo>,
}

#[derive(Deserialize)]
struct ProcessingInfo {
    state: String,
    #[serde(default)]
    error: Option<ProcessingError>,
}

#[derive(Deserialize)]
struct ProcessingError {
    #[serde(default)]
    message: String,
}

/// Map X error bodies onto caller actions
pub fn classify(body: &str) -> Option<HandledError> {
    if body.contains("Unsupported Authentication") {
        return Some(HandledError::refresh_token(
            "X authentication has expired, please reconnect your channel",
        ));
    }
    if body.contains("usage-capped") {
        return Some(HandledError::bad_body(
            "Posting failed - capped reached. Please try again later",
        ));
    }
    if body.contains("duplicate-rules") || body.contains("duplicate content") {
        return Some(HandledError::bad_body(
            "You have already posted this post, please wait before posting again",
        ));
    }
    if body.contains("The Tweet contains an invalid URL.") {
        return Some(HandledError::bad_body(
            "The Tweet contains a URL that is not allowed on X",
        ));
    }
    if body.contains("This user is not allowed to post a video longer than 2 minutes") {
        return Some(HandledError::bad_body(
            "The video you are trying to post is longer than 2 minutes, which is not allowed for this account",
        ));
    }
    None
}

impl XProvider {
    pub fn new(app: OAuthApp, http: ProviderHttp) -> Self {
        Self {
            app,
            http,
            api_url: DEFAULT_API_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            poll: PollPolicy::new(Duration::from_secs(2), 60),
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

    async fn exchange(&self, form: &[(&str, &str)]) -> Result<AuthTokenDetails> {
        let request = self
            .http
            .client()
            .post(self.url("/2/oauth2/token"))
            .basic_auth(
                &self.app.client_id,
                Some(self.app.client_secret.expose_secret()),
            )
            .form(form);
        let token: TokenResponse = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        check_scopes(SCOPES, &token.scope)?;

        let request = self
            .http
            .client()
            .get(self.url("/2/users/me"))
            .query(&[("user.fields", "profile_image_url,verified")])
            .bearer_auth(&token.access_token);
        let me: Envelope<User> = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok(AuthTokenDetails {
            id: me.data.id,
            name: me.data.name,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
            picture: me.data.profile_image_url,
            username: me.data.username,
            additional_settings: Some(json!([{
                "title": "Verified",
                "description": "Is this a verified user? (Premium)",
                "type": "checkbox",
                "value": me.data.verified,
            }])),
        })
    }

    async fn upload_media(&self, access_token: &str, media: &MediaContent) -> Result<String> {
        let file = self.http.download(&media.path).await?;
        let category = if file.is_video() {
            "tweet_video"
        } else if file.content_type == "image/gif" {
            "tweet_gif"
        } else {
            "tweet_image"
        };

        let request = self
            .http
            .client()
            .post(self.url("/2/media/upload/initialize"))
            .bearer_auth(access_token)
            .json(&json!({
                "media_type": file.content_type,
                "total_bytes": file.bytes.len(),
                "media_category": category,
            }));
        let init: Envelope<UploadedMedia> = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        let media_id = init.data.id;

        for (index, chunk) in file.bytes.chunks(UPLOAD_CHUNK_SIZE).enumerate() {
            let form = Form::new()
                .text("segment_index", index.to_string())
                .part(
                    "media",
                    Part::bytes(chunk.to_vec()).file_name(file.file_name.clone()),
                );
            let request = self
                .http
                .client()
                .post(self.url(&format!("/2/media/upload/{}/append", media_id)))
                .bearer_auth(access_token)
                .multipart(form);
            self.http.fetch_once(IDENTIFIER, request, classify).await?;
        }

        let request = self
            .http
            .client()
            .post(self.url(&format!("/2/media/upload/{}/finalize", media_id)))
            .bearer_auth(access_token);
        let finalized: Envelope<UploadedMedia> = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        if finalized.data.processing_info.is_some() {
            self.wait_for_processing(access_token, &media_id).await?;
        }

        if let Some(alt) = media.alt.as_deref().filter(|a| !a.is_empty()) {
            let request = self
                .http
                .client()
                .post(self.url("/2/media/metadata"))
                .bearer_auth(access_token)
                .json(&json!({"id": media_id, "metadata": {"alt_text": {"text": alt}}}));
            self.http.fetch(IDENTIFIER, request, classify).await?;
        }

        debug!(media_id = %media_id, "Uploaded media to X");
        Ok(media_id)
    }

    async fn wait_for_processing(&self, access_token: &str, media_id: &str) -> Result<()> {
        poll_until(IDENTIFIER, self.poll, || async move {
            let request = self
                .http
                .client()
                .get(self.url("/2/media/upload"))
                .query(&[("command", "STATUS"), ("media_id", media_id)])
                .bearer_auth(access_token);
            let status: Envelope<UploadedMedia> = self
                .http
                .fetch(IDENTIFIER, request, classify)
                .await?
                .json()
                .await?;

            Ok(match status.data.processing_info {
                None => PollState::Done(()),
                Some(info) => match info.state.as_str() {
                    "succeeded" => PollState::Done(()),
                    "failed" => PollState::Failed(
                        info.error
                            .map(|e| e.message)
                            .unwrap_or_else(|| "Media processing failed".to_string()),
                    ),
                    _ => PollState::Pending,
                },
            })
        })
        .await
    }

    async fn like_count(&self, access_token: &str, post_id: &str) -> Result<u64> {
        let request = self
            .http
            .client()
            .get(self.url(&format!("/2/tweets/{}", post_id)))
            .query(&[("tweet.fields", "public_metrics")])
            .bearer_auth(access_token);
        let tweet: Envelope<Tweet> = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        Ok(tweet.data.public_metrics.like_count)
    }
}

#[async_trait]
impl SocialProvider for XProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "X"
    }

    fn scopes(&self) -> &[&'static str] {
        SCOPES
    }

    fn max_concurrent_job(&self) -> usize {
        1
    }

    fn max_length(&self, additional_settings: &serde_json::Value) -> usize {
        let verified = additional_settings
            .as_array()
            .and_then(|settings| {
                settings
                    .iter()
                    .find(|s| s.get("title").and_then(|t| t.as_str()) == Some("Verified"))
            })
            .and_then(|s| s.get("value"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if verified {
            4000
        } else {
            200
        }
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        let code_verifier = make_id(VERIFIER_LENGTH);
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri(IDENTIFIER).as_str()),
                ("scope", SCOPES.join(" ").as_str()),
                ("state", state.as_str()),
                ("code_challenge", pkce_challenge(&code_verifier).as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| ProviderError::Validation(format!("Invalid X authorize URL: {}", e)))?;

        Ok(GenerateAuthUrlResponse {
            url: url.to_string(),
            code_verifier,
            state,
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        let redirect_uri = self.app.redirect_uri(IDENTIFIER);
        self.exchange(&[
            ("grant_type", "authorization_code"),
            ("code", params.code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("code_verifier", params.code_verifier.as_str()),
            ("client_id", self.app.client_id.as_str()),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        self.exchange(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.app.client_id.as_str()),
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
        let mut responses = Vec::with_capacity(posts.len());
        let mut reply_to: Option<String> = None;

        let result = async {
            for post in posts {
                let settings: XSettings = post.settings()?;
                let media_ids = try_join_all(
                    post.media
                        .iter()
                        .map(|media| self.upload_media(access_token, media)),
                )
                .await?;

                let mut body = json!({ "text": strip_html(&post.message) });
                if !media_ids.is_empty() {
                    body["media"] = json!({ "media_ids": media_ids });
                }
                if let Some(previous) = &reply_to {
                    body["reply"] = json!({ "in_reply_to_tweet_id": previous });
                }
                match settings.who_can_reply_post.as_deref() {
                    None | Some("everyone") => {}
                    Some(audience) => body["reply_settings"] = json!(audience),
                }
                if let Some(community) = settings.community.as_deref() {
                    let community_id = community.rsplit('/').next().unwrap_or(community);
                    body["community_id"] = json!(community_id);
                }

                let request = self
                    .http
                    .client()
                    .post(self.url("/2/tweets"))
                    .bearer_auth(access_token)
                    .json(&body);
                let created: Envelope<CreatedTweet> = self
                    .http
                    .fetch(IDENTIFIER, request, classify)
                    .await?
                    .json()
                    .await?;

                let tweet_id = created.data.id;
                info!(tweet_id = %tweet_id, "Published to X");
                responses.push(PostResponse::posted(
                    &post.id,
                    &tweet_id,
                    format!("https://x.com/{}/status/{}", integration.profile, tweet_id),
                ));
                reply_to = Some(tweet_id);
            }
            Ok::<_, PostgridError>(())
        }
        .await;

        finish_chain(responses, result)
    }

    async fn mention(
        &self,
        access_token: &str,
        query: &str,
        _integration: &Integration,
    ) -> Result<Vec<MentionCandidate>> {
        let response = self
            .http
            .client()
            .get(self.url(&format!("/2/users/by/username/{}", query.trim_start_matches('@'))))
            .query(&[("user.fields", "username,name,profile_image_url")])
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        #[derive(Deserialize)]
        struct Lookup {
            #[serde(default)]
            data: Option<User>,
        }
        let lookup: Lookup = response.json().await?;
        Ok(lookup
            .data
            .map(|user| MentionCandidate {
                id: user.username,
                label: user.name,
                image: user.profile_image_url.unwrap_or_default(),
            })
            .into_iter()
            .collect())
    }

    fn handle_errors(&self, body: &str) -> Option<HandledError> {
        classify(body)
    }

    async fn auto_repost_post(
        &self,
        integration: &Integration,
        post_id: &str,
        min_likes: u64,
    ) -> Result<bool> {
        if self.like_count(&integration.token, post_id).await? < min_likes {
            return Ok(false);
        }

        let request = self
            .http
            .client()
            .post(self.url(&format!("/2/users/{}/retweets", integration.internal_id)))
            .bearer_auth(&integration.token)
            .json(&json!({ "tweet_id": post_id }));
        self.http.fetch(IDENTIFIER, request, classify).await?;
        Ok(true)
    }

    async fn auto_plug_post(
        &self,
        integration: &Integration,
        post_id: &str,
        min_likes: u64,
        message: &str,
    ) -> Result<bool> {
        if self.like_count(&integration.token, post_id).await? < min_likes {
            return Ok(false);
        }

        let request = self
            .http
            .client()
            .post(self.url("/2/tweets"))
            .bearer_auth(&integration.token)
            .json(&json!({
                "text": strip_html(message),
                "reply": { "in_reply_to_tweet_id": post_id },
            }));
        self.http.fetch(IDENTIFIER, request, classify).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PostgridError;
    use crate::providers::http::RetryPolicy;
    use crate::types::HandledErrorKind;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> XProvider {
        let app = OAuthApp::new("x-client", "x-secret", "https://app.example.com");
        let http = ProviderHttp::new(RetryPolicy::new(0, Duration::from_millis(1)));
        XProvider::new(app, http)
            .with_api_url(server.uri())
            .with_poll_policy(PollPolicy::new(Duration::from_millis(1), 5))
    }

    fn integration() -> Integration {
        Integration {
            id: "int-1".to_string(),
            internal_id: "42".to_string(),
            name: "Ada".to_string(),
            provider_identifier: IDENTIFIER.to_string(),
            token: "access".to_string(),
            profile: "ada".to_string(),
            ..Default::default()
        }
    }

    async fn mount_me(server: &MockServer, verified: bool) {
        Mock::given(method("GET"))
            .and(path("/2/users/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "42",
                    "name": "Ada",
                    "username": "ada",
                    "profile_image_url": "https://pbs.example/ada.jpg",
                    "verified": verified
                }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_generate_auth_url() {
        let server = MockServer::start().await;
        let auth = provider(&server).generate_auth_url().unwrap();

        assert_eq!(auth.state.len(), 16);
        assert_eq!(auth.code_verifier.len(), 64);
        assert!(auth.url.starts_with("https://x.com/i/oauth2/authorize?"));
        assert!(auth.url.contains("client_id=x-client"));
        assert!(auth.url.contains(&pkce_challenge(&auth.code_verifier)));
        assert!(auth.url.contains(&format!("state={}", auth.state)));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "refresh_token": "refresh",
                "expires_in": 7200,
                "scope": "tweet.read tweet.write users.read offline.access media.write"
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_me(&server, true).await;

        let x = provider(&server);
        let details = x
            .authenticate(&AuthenticateParams::code("code").with_verifier("verifier"))
            .await
            .unwrap();

        assert_eq!(details.id, "42");
        assert_eq!(details.username, "ada");
        assert_eq!(details.access_token, "access");
        assert_eq!(details.refresh_token.as_deref(), Some("refresh"));
        let settings = details.additional_settings.unwrap();
        assert_eq!(x.max_length(&settings), 4000);
    }

    #[tokio::test]
    async fn test_authenticate_rejects_missing_scopes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "scope": "tweet.read users.read"
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .authenticate(&AuthenticateParams::code("code"))
            .await
            .unwrap_err();
        match err {
            PostgridError::Provider(ProviderError::NotEnoughScopes(missing)) => {
                assert!(missing.contains(&"tweet.write".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_post_thread_chains_replies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(body_partial_json(json!({"text": "first"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "100"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(body_partial_json(json!({
                "text": "second",
                "reply": {"in_reply_to_tweet_id": "100"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "101"}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(body_partial_json(json!({
                "text": "third",
                "reply": {"in_reply_to_tweet_id": "101"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "102"}})))
            .expect(1)
            .mount(&server)
            .await;

        let posts = vec![
            PostDetails::new("a", "<p>first</p>"),
            PostDetails::new("b", "second"),
            PostDetails::new("c", "third"),
        ];
        let responses = provider(&server)
            .post("42", "access", &posts, &integration())
            .await
            .unwrap();

        let ids: Vec<&str> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let post_ids: Vec<&str> = responses.iter().map(|r| r.post_id.as_str()).collect();
        assert_eq!(post_ids, vec!["100", "101", "102"]);
        assert_eq!(responses[2].release_url, "https://x.com/ada/status/102");
    }

    #[tokio::test]
    async fn test_post_video_waits_for_processing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cdn/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/initialize"))
            .and(body_partial_json(json!({"media_category": "tweet_video"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "m1"}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/m1/append"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/m1/finalize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m1", "processing_info": {"state": "pending"}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2/media/upload"))
            .and(query_param("command", "STATUS"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m1", "processing_info": {"state": "in_progress"}}
            })))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2/media/upload"))
            .and(query_param("command", "STATUS"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m1", "processing_info": {"state": "succeeded"}}
            })))
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(body_partial_json(json!({"media": {"media_ids": ["m1"]}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": "200"}})))
            .expect(1)
            .mount(&server)
            .await;

        let post = PostDetails::new("a", "watch this").with_media(vec![MediaContent::video(
            format!("{}/cdn/clip.mp4", server.uri()),
        )]);
        let responses = provider(&server)
            .post("42", "access", &[post], &integration())
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].post_id, "200");
    }

    #[tokio::test]
    async fn test_post_surfaces_processing_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cdn/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 8]))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/initialize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "m1"}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/m1/append"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/media/upload/m1/finalize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m1", "processing_info": {"state": "pending"}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2/media/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m1", "processing_info": {
                    "state": "failed",
                    "error": {"message": "Unsupported codec"}
                }}
            })))
            .mount(&server)
            .await;

        let post = PostDetails::new("a", "clip")
            .with_media(vec![MediaContent::video(format!("{}/cdn/clip.mp4", server.uri()))]);
        let err = provider(&server)
            .post("42", "access", &[post], &integration())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PostgridError::Provider(ProviderError::JobFailed { ref message, .. }) if message == "Unsupported codec"
        ));
    }

    #[tokio::test]
    async fn test_post_duplicate_is_bad_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                r#"{"detail":"You are not allowed to create a Tweet with duplicate content."}"#,
            ))
            .mount(&server)
            .await;

        let err = provider(&server)
            .post("42", "access", &[PostDetails::new("a", "again")], &integration())
            .await
            .unwrap_err();
        match err {
            PostgridError::Provider(ProviderError::BadBody { message, .. }) => {
                assert!(message.contains("already posted"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_auto_repost_respects_like_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2/tweets/100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "100", "public_metrics": {"like_count": 5}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/users/42/retweets"))
            .and(body_partial_json(json!({"tweet_id": "100"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"retweeted": true}})))
            .expect(1)
            .mount(&server)
            .await;

        let x = provider(&server);
        assert!(!x.auto_repost_post(&integration(), "100", 10).await.unwrap());
        assert!(x.auto_repost_post(&integration(), "100", 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_mention_unknown_user_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2/users/by/username/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2/users/by/username/ada"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "42", "name": "Ada", "username": "ada", "profile_image_url": "img"}
            })))
            .mount(&server)
            .await;

        let x = provider(&server);
        assert!(x.mention("t", "ghost", &integration()).await.unwrap().is_empty());
        let found = x.mention("t", "@ada", &integration()).await.unwrap();
        assert_eq!(found[0].id, "ada");
        assert_eq!(found[0].label, "Ada");
    }

    #[test]
    fn test_handle_errors() {
        let server_less = XProvider::new(
            OAuthApp::new("id", "secret", "https://app"),
            ProviderHttp::new(RetryPolicy::default()),
        );
        let refresh = server_less
            .handle_errors(r#"{"title":"Unsupported Authentication"}"#)
            .unwrap();
        assert_eq!(refresh.kind, HandledErrorKind::RefreshToken);
        let capped = server_less.handle_errors("usage-capped").unwrap();
        assert_eq!(capped.kind, HandledErrorKind::BadBody);
        assert!(server_less.handle_errors("something else").is_none());
    }

    #[test]
    fn test_max_length_defaults_to_standard_accounts() {
        let x = XProvider::new(
            OAuthApp::new("id", "secret", "https://app"),
            ProviderHttp::new(RetryPolicy::default()),
        );
        assert_eq!(x.max_length(&serde_json::Value::Null), 200);
        assert_eq!(
            x.max_length(&json!([{"title": "Verified", "value": false}])),
            200
        );
    }
}
