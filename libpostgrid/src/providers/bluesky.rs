//! Bluesky adapter
//!
//! Bluesky has no OAuth app registration here: the user types in their PDS,
//! handle and an app password. The frontend sends them as a base64-encoded
//! JSON payload in place of an authorization code.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use futures::future::try_join_all;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

use super::http::{
    make_id, poll_until, PollPolicy, PollState, ProviderHttp, STATE_LENGTH, VERIFIER_LENGTH,
};
use super::{finish_chain, strip_html, SocialProvider};
use crate::error::{PostgridError, ProviderError, Result};
use crate::types::{
    AuthTokenDetails, AuthenticateParams, CustomField, CustomFieldType, GenerateAuthUrlResponse,
    HandledError, Integration, MediaContent, MentionCandidate, PostDetails, PostResponse,
};

pub const IDENTIFIER: &str = "bluesky";

pub const DEFAULT_SERVICE: &str = "https://bsky.social";
const DEFAULT_VIDEO_SERVICE: &str = "https://video.bsky.app";
const POST_COLLECTION: &str = "app.bsky.feed.post";
const REPOST_COLLECTION: &str = "app.bsky.feed.repost";

/// Credentials typed in by the user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlueskyCredentials {
    pub service: String,
    pub identifier: String,
    pub password: String,
}

impl BlueskyCredentials {
    /// Encode as the payload expected by [`SocialProvider::authenticate`]
    pub fn encode(&self) -> String {
        STANDARD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| ProviderError::Validation(format!("Invalid credential payload: {}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ProviderError::Validation(format!("Invalid credential payload: {}", e)).into()
        })
    }
}

pub struct BlueskyProvider {
    http: ProviderHttp,
    default_service: String,
    video_service: String,
    poll: PollPolicy,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    refresh_jwt: String,
    did: String,
    handle: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    did: String,
    handle: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct StrongRef {
    uri: String,
    cid: String,
}

#[derive(Deserialize)]
struct UploadedBlob {
    blob: Value,
}

#[derive(Deserialize)]
struct ServiceAuth {
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoJob {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusEnvelope {
    job_status: JobStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    blob: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct Posts {
    posts: Vec<PostView>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    uri: String,
    cid: String,
    #[serde(default)]
    like_count: u64,
}

#[derive(Deserialize)]
struct Actors {
    actors: Vec<Profile>,
}

/// Map Bluesky error bodies onto caller actions
pub fn classify(body: &str) -> Option<HandledError> {
    if body.contains("ExpiredToken") || body.contains("InvalidToken") {
        return Some(HandledError::refresh_token(
            "Bluesky session has expired, please reconnect your channel",
        ));
    }
    if body.contains("BlobTooLarge") {
        return Some(HandledError::bad_body("The attached media is too large for Bluesky"));
    }
    None
}

/// Link and hashtag facets with UTF-8 byte offsets, as the AT protocol expects
pub fn detect_facets(text: &str) -> Vec<Value> {
    static LINK: OnceLock<regex::Regex> = OnceLock::new();
    static TAG: OnceLock<regex::Regex> = OnceLock::new();
    let link = LINK.get_or_init(|| regex::Regex::new(r"https?://[^\s]+").expect("Valid regex"));
    let tag = TAG.get_or_init(|| regex::Regex::new(r"(?:^|\s)(#[^\s#]+)").expect("Valid regex"));

    let mut facets = Vec::new();
    for found in link.find_iter(text) {
        let uri = found
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')'));
        facets.push(json!({
            "index": {"byteStart": found.start(), "byteEnd": found.start() + uri.len()},
            "features": [{"$type": "app.bsky.richtext.facet#link", "uri": uri}]
        }));
    }
    for captures in tag.captures_iter(text) {
        if let Some(found) = captures.get(1) {
            let value = found
                .as_str()
                .trim_end_matches(|c: char| c.is_ascii_punctuation());
            if value.len() < 2 {
                continue;
            }
            facets.push(json!({
                "index": {"byteStart": found.start(), "byteEnd": found.start() + value.len()},
                "features": [{"$type": "app.bsky.richtext.facet#tag", "tag": &value[1..]}]
            }));
        }
    }
    facets
}

/// Record key of an `at://` URI
fn record_key(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

impl BlueskyProvider {
    pub fn new(http: ProviderHttp) -> Self {
        Self {
            http,
            default_service: DEFAULT_SERVICE.to_string(),
            video_service: DEFAULT_VIDEO_SERVICE.to_string(),
            poll: PollPolicy::new(Duration::from_secs(3), 100),
        }
    }

    /// Service used when an integration does not carry its own PDS
    pub fn with_service(mut self, url: impl Into<String>) -> Self {
        self.default_service = url.into();
        self
    }

    pub fn with_video_service(mut self, url: impl Into<String>) -> Self {
        self.video_service = url.into();
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn service_for(&self, integration: &Integration) -> String {
        integration
            .custom_instance_details
            .as_deref()
            .and_then(|payload| BlueskyCredentials::decode(payload).ok())
            .map(|credentials| credentials.service)
            .filter(|service| !service.is_empty())
            .unwrap_or_else(|| self.default_service.clone())
    }

    fn xrpc(service: &str, method: &str) -> String {
        format!("{}/xrpc/{}", service.trim_end_matches('/'), method)
    }

    async fn create_session(&self, credentials: &BlueskyCredentials) -> Result<Session> {
        let response = self
            .http
            .client()
            .post(Self::xrpc(&credentials.service, "com.atproto.server.createSession"))
            .json(&json!({
                "identifier": credentials.identifier,
                "password": credentials.password,
            }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::BAD_REQUEST
        {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "Bluesky login rejected: {}", body);
            return Err(ProviderError::InvalidCredentials(format!(
                "Bluesky rejected the login for {}",
                credentials.identifier
            ))
            .into());
        }
        Ok(response.error_for_status()?.json().await?)
    }

    async fn profile(&self, service: &str, access_jwt: &str, actor: &str) -> Result<Profile> {
        let request = self
            .http
            .client()
            .get(Self::xrpc(service, "app.bsky.actor.getProfile"))
            .query(&[("actor", actor)])
            .bearer_auth(access_jwt);
        Ok(self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?)
    }

    fn details(session: Session, profile: Profile) -> AuthTokenDetails {
        AuthTokenDetails {
            id: session.did,
            name: profile
                .display_name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| profile.handle.clone()),
            access_token: session.access_jwt,
            refresh_token: Some(session.refresh_jwt),
            // Sessions are refreshed on demand, the record never expires
            expires_in: Some(100 * 365 * 24 * 60 * 60),
            picture: profile.avatar,
            username: session.handle,
            additional_settings: None,
        }
    }

    async fn upload_blob(&self, service: &str, access_jwt: &str, bytes: Vec<u8>, content_type: &str) -> Result<Value> {
        let request = self
            .http
            .client()
            .post(Self::xrpc(service, "com.atproto.repo.uploadBlob"))
            .bearer_auth(access_jwt)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        let uploaded: UploadedBlob = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        Ok(uploaded.blob)
    }

    async fn upload_video(&self, service: &str, access_jwt: &str, did: &str, media: &MediaContent) -> Result<Value> {
        let file = self.http.download(&media.path).await?;
        let host = Url::parse(service)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "bsky.social".to_string());
        let expires = (Utc::now().timestamp() + 30 * 60).to_string();

        let request = self
            .http
            .client()
            .get(Self::xrpc(service, "com.atproto.server.getServiceAuth"))
            .query(&[
                ("aud", format!("did:web:{}", host).as_str()),
                ("lxm", "com.atproto.repo.uploadBlob"),
                ("exp", expires.as_str()),
            ])
            .bearer_auth(access_jwt);
        let auth: ServiceAuth = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        let request = self
            .http
            .client()
            .post(Self::xrpc(&self.video_service, "app.bsky.video.uploadVideo"))
            .query(&[("did", did), ("name", file.file_name.as_str())])
            .bearer_auth(&auth.token)
            .header(reqwest::header::CONTENT_TYPE, "video/mp4")
            .body(file.bytes);
        let job: VideoJob = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        debug!(job_id = %job.job_id, "Bluesky video job submitted");

        let job_id = job.job_id.as_str();
        poll_until(IDENTIFIER, self.poll, || async move {
            let request = self
                .http
                .client()
                .get(Self::xrpc(&self.video_service, "app.bsky.video.getJobStatus"))
                .query(&[("jobId", job_id)]);
            let status: JobStatusEnvelope = self
                .http
                .fetch(IDENTIFIER, request, classify)
                .await?
                .json()
                .await?;
            let status = status.job_status;
            Ok(match status.state.as_str() {
                "JOB_STATE_COMPLETED" => match status.blob {
                    Some(blob) => PollState::Done(blob),
                    None => PollState::Failed("Video job completed without a blob".to_string()),
                },
                "JOB_STATE_FAILED" => PollState::Failed(
                    status
                        .message
                        .or(status.error)
                        .unwrap_or_else(|| "Video processing failed".to_string()),
                ),
                _ => PollState::Pending,
            })
        })
        .await
    }

    async fn embed(&self, service: &str, access_jwt: &str, did: &str, media: &[MediaContent]) -> Result<Option<Value>> {
        if let Some(video) = media.iter().find(|m| m.is_video()) {
            let blob = self.upload_video(service, access_jwt, did, video).await?;
            return Ok(Some(json!({"$type": "app.bsky.embed.video", "video": blob})));
        }
        if media.is_empty() {
            return Ok(None);
        }

        let images = try_join_all(media.iter().map(|item| async move {
            let file = self.http.download(&item.path).await?;
            let blob = self
                .upload_blob(service, access_jwt, file.bytes, &file.content_type)
                .await?;
            Ok::<_, PostgridError>(json!({
                "alt": item.alt.clone().unwrap_or_default(),
                "image": blob,
            }))
        }))
        .await?;
        Ok(Some(json!({"$type": "app.bsky.embed.images", "images": images})))
    }

    async fn create_record(&self, service: &str, access_jwt: &str, did: &str, collection: &str, record: Value) -> Result<StrongRef> {
        let request = self
            .http
            .client()
            .post(Self::xrpc(service, "com.atproto.repo.createRecord"))
            .bearer_auth(access_jwt)
            .json(&json!({"repo": did, "collection": collection, "record": record}));
        Ok(self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?)
    }

    async fn post_view(&self, service: &str, access_jwt: &str, uri: &str) -> Result<PostView> {
        let request = self
            .http
            .client()
            .get(Self::xrpc(service, "app.bsky.feed.getPosts"))
            .query(&[("uris", uri)])
            .bearer_auth(access_jwt);
        let posts: Posts = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        posts.posts.into_iter().next().ok_or_else(|| {
            ProviderError::Posting(format!("Bluesky post {} not found", uri)).into()
        })
    }
}

fn text_record(text: &str, embed: Option<Value>, reply: Option<(&StrongRef, &StrongRef)>) -> Value {
    let mut record = json!({
        "$type": POST_COLLECTION,
        "text": text,
        "facets": detect_facets(text),
        "createdAt": Utc::now().to_rfc3339(),
    });
    if let Some(embed) = embed {
        record["embed"] = embed;
    }
    if let Some((root, parent)) = reply {
        record["reply"] = json!({"root": root, "parent": parent});
    }
    record
}

#[async_trait]
impl SocialProvider for BlueskyProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "Bluesky"
    }

    fn scopes(&self) -> &[&'static str] {
        &[]
    }

    fn max_concurrent_job(&self) -> usize {
        2
    }

    fn max_length(&self, _additional_settings: &Value) -> usize {
        300
    }

    fn custom_fields(&self) -> Vec<CustomField> {
        vec![
            CustomField {
                key: "service".to_string(),
                label: "Service".to_string(),
                field_type: CustomFieldType::Text,
                default_value: DEFAULT_SERVICE.to_string(),
                validation: r"^(https?:\/\/)?([\da-z\.-]+)\.([a-z\.]{2,6})([\/\w \.-]*)*\/?$"
                    .to_string(),
            },
            CustomField {
                key: "identifier".to_string(),
                label: "Identifier".to_string(),
                field_type: CustomFieldType::Text,
                default_value: String::new(),
                validation: r"^.+$".to_string(),
            },
            CustomField {
                key: "password".to_string(),
                label: "Password".to_string(),
                field_type: CustomFieldType::Password,
                default_value: String::new(),
                validation: r"^.{3,}$".to_string(),
            },
        ]
    }

    /// Credential providers have no authorization redirect
    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        Ok(GenerateAuthUrlResponse {
            url: String::new(),
            code_verifier: make_id(VERIFIER_LENGTH),
            state: make_id(STATE_LENGTH),
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        let credentials = BlueskyCredentials::decode(&params.code)?;
        let session = self.create_session(&credentials).await?;
        let profile = self
            .profile(&credentials.service, &session.access_jwt, &session.did)
            .await?;
        info!(did = %profile.did, "Authenticated Bluesky account");
        Ok(Self::details(session, profile))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        let service = self.default_service.clone();
        let request = self
            .http
            .client()
            .post(Self::xrpc(&service, "com.atproto.server.refreshSession"))
            .bearer_auth(refresh_token);
        let session: Session = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        let profile = self.profile(&service, &session.access_jwt, &session.did).await?;
        Ok(Self::details(session, profile))
    }

    async fn post(
        &self,
        id: &str,
        access_token: &str,
        posts: &[PostDetails],
        integration: &Integration,
    ) -> Result<Vec<PostResponse>> {
        let service = self.service_for(integration);
        let mut responses = Vec::with_capacity(posts.len());
        let mut root: Option<StrongRef> = None;
        let mut parent: Option<StrongRef> = None;

        let result = async {
            for post in posts {
                let text = strip_html(&post.message);
                let embed = self.embed(&service, access_token, id, &post.media).await?;
                let reply = match (&root, &parent) {
                    (Some(root), Some(parent)) => Some((root, parent)),
                    _ => None,
                };
                let record = text_record(&text, embed, reply);
                let created = self
                    .create_record(&service, access_token, id, POST_COLLECTION, record)
                    .await?;

                info!(uri = %created.uri, "Published to Bluesky");
                responses.push(PostResponse::posted(
                    &post.id,
                    &created.uri,
                    format!(
                        "https://bsky.app/profile/{}/post/{}",
                        integration.profile,
                        record_key(&created.uri)
                    ),
                ));
                if root.is_none() {
                    root = Some(created.clone());
                }
                parent = Some(created);
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
        integration: &Integration,
    ) -> Result<Vec<MentionCandidate>> {
        let service = self.service_for(integration);
        let request = self
            .http
            .client()
            .get(Self::xrpc(&service, "app.bsky.actor.searchActorsTypeahead"))
            .query(&[("q", query), ("limit", "8")])
            .bearer_auth(access_token);
        let actors: Actors = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        Ok(actors
            .actors
            .into_iter()
            .map(|actor| MentionCandidate {
                label: actor.display_name.unwrap_or_else(|| actor.handle.clone()),
                id: actor.handle,
                image: actor.avatar.unwrap_or_default(),
            })
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
        let service = self.service_for(integration);
        let view = self.post_view(&service, &integration.token, post_id).await?;
        if view.like_count < min_likes {
            return Ok(false);
        }

        let record = json!({
            "$type": REPOST_COLLECTION,
            "subject": {"uri": view.uri, "cid": view.cid},
            "createdAt": Utc::now().to_rfc3339(),
        });
        self.create_record(
            &service,
            &integration.token,
            &integration.internal_id,
            REPOST_COLLECTION,
            record,
        )
        .await?;
        Ok(true)
    }

    async fn auto_plug_post(
        &self,
        integration: &Integration,
        post_id: &str,
        min_likes: u64,
        message: &str,
    ) -> Result<bool> {
        let service = self.service_for(integration);
        let view = self.post_view(&service, &integration.token, post_id).await?;
        if view.like_count < min_likes {
            return Ok(false);
        }

        let target = StrongRef {
            uri: view.uri,
            cid: view.cid,
        };
        let record = text_record(&strip_html(message), None, Some((&target, &target)));
        self.create_record(
            &service,
            &integration.token,
            &integration.internal_id,
            POST_COLLECTION,
            record,
        )
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::http::RetryPolicy;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> BlueskyProvider {
        let http = ProviderHttp::new(RetryPolicy::new(0, Duration::from_millis(1)));
        BlueskyProvider::new(http)
            .with_service(server.uri())
            .with_video_service(server.uri())
            .with_poll_policy(PollPolicy::new(Duration::from_millis(1), 5))
    }

    fn credentials(server: &MockServer) -> BlueskyCredentials {
        BlueskyCredentials {
            service: server.uri(),
            identifier: "alice.bsky.social".to_string(),
            password: "app-password".to_string(),
        }
    }

    fn integration(server: &MockServer) -> Integration {
        Integration {
            id: "int-1".to_string(),
            internal_id: "did:plc:alice".to_string(),
            name: "Alice".to_string(),
            provider_identifier: IDENTIFIER.to_string(),
            token: "access-jwt".to_string(),
            profile: "alice.bsky.social".to_string(),
            custom_instance_details: Some(credentials(server).encode()),
            ..Default::default()
        }
    }

    #[test]
    fn test_credentials_round_trip() {
        let original = BlueskyCredentials {
            service: DEFAULT_SERVICE.to_string(),
            identifier: "alice".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(BlueskyCredentials::decode(&original.encode()).unwrap(), original);
        assert!(BlueskyCredentials::decode("not base64!").is_err());
    }

    #[test]
    fn test_detect_facets_uses_byte_offsets() {
        let text = "héllo https://example.com/a. #rust";
        let facets = detect_facets(text);
        assert_eq!(facets.len(), 2);

        let link = &facets[0];
        assert_eq!(link["features"][0]["uri"], "https://example.com/a");
        let start = link["index"]["byteStart"].as_u64().unwrap() as usize;
        let end = link["index"]["byteEnd"].as_u64().unwrap() as usize;
        assert_eq!(&text[start..end], "https://example.com/a");

        let tag = &facets[1];
        assert_eq!(tag["features"][0]["tag"], "rust");
    }

    #[tokio::test]
    async fn test_custom_fields_and_empty_auth_url() {
        let server = MockServer::start().await;
        let bluesky = provider(&server);
        let keys: Vec<String> = bluesky.custom_fields().into_iter().map(|f| f.key).collect();
        assert_eq!(keys, vec!["service", "identifier", "password"]);
        let auth = bluesky.generate_auth_url().unwrap();
        assert!(auth.url.is_empty());
        assert_eq!(auth.state.len(), 16);
    }

    #[tokio::test]
    async fn test_authenticate_with_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .and(body_partial_json(json!({"identifier": "alice.bsky.social"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessJwt": "access-jwt",
                "refreshJwt": "refresh-jwt",
                "did": "did:plc:alice",
                "handle": "alice.bsky.social"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.actor.getProfile"))
            .and(query_param("actor", "did:plc:alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "did": "did:plc:alice",
                "handle": "alice.bsky.social",
                "displayName": "Alice",
                "avatar": "https://cdn.bsky.app/alice.jpg"
            })))
            .mount(&server)
            .await;

        let details = provider(&server)
            .authenticate(&AuthenticateParams::code(credentials(&server).encode()))
            .await
            .unwrap();
        assert_eq!(details.id, "did:plc:alice");
        assert_eq!(details.name, "Alice");
        assert_eq!(details.username, "alice.bsky.social");
        assert_eq!(details.refresh_token.as_deref(), Some("refresh-jwt"));
    }

    #[tokio::test]
    async fn test_authenticate_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "AuthenticationRequired",
                "message": "Invalid identifier or password"
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .authenticate(&AuthenticateParams::code(credentials(&server).encode()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PostgridError::Provider(ProviderError::InvalidCredentials(_))
        ));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_post_thread_sets_root_and_parent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({"record": {"text": "first"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/r1", "cid": "c1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({"record": {
                "text": "second",
                "reply": {
                    "root": {"uri": "at://did:plc:alice/app.bsky.feed.post/r1", "cid": "c1"},
                    "parent": {"uri": "at://did:plc:alice/app.bsky.feed.post/r1", "cid": "c1"}
                }
            }})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/r2", "cid": "c2"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({"record": {
                "text": "third",
                "reply": {
                    "root": {"uri": "at://did:plc:alice/app.bsky.feed.post/r1", "cid": "c1"},
                    "parent": {"uri": "at://did:plc:alice/app.bsky.feed.post/r2", "cid": "c2"}
                }
            }})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/r3", "cid": "c3"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let posts = vec![
            PostDetails::new("a", "first"),
            PostDetails::new("b", "second"),
            PostDetails::new("c", "third"),
        ];
        let responses = provider(&server)
            .post("did:plc:alice", "access-jwt", &posts, &integration(&server))
            .await
            .unwrap();

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[2].post_id, "at://did:plc:alice/app.bsky.feed.post/r3");
        assert_eq!(
            responses[0].release_url,
            "https://bsky.app/profile/alice.bsky.social/post/r1"
        );
    }

    async fn mount_video_upload(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/cdn/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 32]))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.server.getServiceAuth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "svc"})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/app.bsky.video.uploadVideo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobId": "job-1", "did": "did:plc:alice", "state": "JOB_STATE_CREATED"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_video_job_polls_until_complete() {
        let server = MockServer::start().await;
        mount_video_upload(&server).await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.video.getJobStatus"))
            .and(query_param("jobId", "job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobStatus": {"jobId": "job-1", "state": "JOB_STATE_ENCODING"}
            })))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.video.getJobStatus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobStatus": {
                    "jobId": "job-1",
                    "state": "JOB_STATE_COMPLETED",
                    "blob": {"$type": "blob", "ref": {"$link": "bafy"}, "mimeType": "video/mp4", "size": 32}
                }
            })))
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({"record": {"embed": {"$type": "app.bsky.embed.video"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.post/v1", "cid": "cv"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let post = PostDetails::new("a", "clip")
            .with_media(vec![MediaContent::video(format!("{}/cdn/clip.mp4", server.uri()))]);
        let responses = provider(&server)
            .post("did:plc:alice", "access-jwt", &[post], &integration(&server))
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].post_id, "at://did:plc:alice/app.bsky.feed.post/v1");
    }

    #[tokio::test]
    async fn test_video_job_failure_carries_vendor_message() {
        let server = MockServer::start().await;
        mount_video_upload(&server).await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.video.getJobStatus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobStatus": {"jobId": "job-1", "state": "JOB_STATE_FAILED", "error": "Video too long"}
            })))
            .mount(&server)
            .await;

        let post = PostDetails::new("a", "clip")
            .with_media(vec![MediaContent::video(format!("{}/cdn/clip.mp4", server.uri()))]);
        let err = provider(&server)
            .post("did:plc:alice", "access-jwt", &[post], &integration(&server))
            .await
            .unwrap_err();
        match err {
            PostgridError::Provider(ProviderError::JobFailed { message, .. }) => {
                assert_eq!(message, "Video too long");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_auto_repost_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getPosts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "posts": [{"uri": "at://did:plc:alice/app.bsky.feed.post/r1", "cid": "c1", "likeCount": 3}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({"collection": "app.bsky.feed.repost"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/app.bsky.feed.repost/x", "cid": "cx"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let bluesky = provider(&server);
        let target = "at://did:plc:alice/app.bsky.feed.post/r1";
        assert!(!bluesky.auto_repost_post(&integration(&server), target, 4).await.unwrap());
        assert!(bluesky.auto_repost_post(&integration(&server), target, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_mention_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.actor.searchActorsTypeahead"))
            .and(query_param("q", "bob"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "actors": [{"did": "did:plc:bob", "handle": "bob.bsky.social", "displayName": "Bob"}]
            })))
            .mount(&server)
            .await;

        let found = provider(&server)
            .mention("access-jwt", "bob", &integration(&server))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "bob.bsky.social");
        assert_eq!(found[0].label, "Bob");
    }
}
