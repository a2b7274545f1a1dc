//! Threads adapter

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

pub const IDENTIFIER: &str = "threads";

const SCOPES: &[&str] = &[
    "threads_basic",
    "threads_content_publish",
    "threads_manage_replies",
    "threads_manage_insights",
];
const DEFAULT_API_URL: &str = "https://graph.threads.net";
const DEFAULT_AUTHORIZE_URL: &str = "https://threads.net/oauth/authorize";

pub struct ThreadsProvider {
    app: OAuthApp,
    http: ProviderHttp,
    api_url: String,
    authorize_url: String,
    poll: PollPolicy,
}

#[derive(Deserialize)]
struct Token {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct Me {
    id: String,
    username: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    threads_profile_picture_url: Option<String>,
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

pub fn classify(body: &str) -> Option<HandledError> {
    classify_graph(body)
}

impl ThreadsProvider {
    pub fn new(app: OAuthApp, http: ProviderHttp) -> Self {
        Self {
            app,
            http,
            api_url: DEFAULT_API_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            poll: PollPolicy::new(Duration::from_secs(3), 60),
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

    async fn profile(&self, access_token: &str, expires_in: Option<i64>) -> Result<AuthTokenDetails> {
        let request = self.http.client().get(self.url("/v1.0/me")).query(&[
            ("fields", "id,username,name,threads_profile_picture_url"),
            ("access_token", access_token),
        ]);
        let me: Me = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok(AuthTokenDetails {
            id: me.id,
            name: me.name.filter(|n| !n.is_empty()).unwrap_or_else(|| me.username.clone()),
            access_token: access_token.to_string(),
            refresh_token: Some(access_token.to_string()),
            expires_in,
            picture: me.threads_profile_picture_url,
            username: me.username,
            additional_settings: None,
        })
    }

    /// Create a container and wait until it can be published
    async fn container(&self, id: &str, access_token: &str, mut form: Vec<(&'static str, String)>) -> Result<String> {
        form.push(("access_token", access_token.to_string()));
        let request = self
            .http
            .client()
            .post(self.url(&format!("/v1.0/{}/threads", id)))
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
            &self.url(&format!("/v1.0/{}", created.id)),
            access_token,
            "status",
            self.poll,
            classify,
        )
        .await?;
        Ok(created.id)
    }

    fn media_fields(media: &MediaContent) -> Vec<(&'static str, String)> {
        if media.is_video() {
            vec![("media_type", "VIDEO".to_string()), ("video_url", media.path.clone())]
        } else {
            vec![("media_type", "IMAGE".to_string()), ("image_url", media.path.clone())]
        }
    }

    /// Publish one item, optionally as a reply, returning its media id and permalink
    async fn publish(
        &self,
        id: &str,
        access_token: &str,
        post: &PostDetails,
        reply_to: Option<&str>,
    ) -> Result<(String, String)> {
        let text = strip_html(&post.message);
        let mut form = match post.media.as_slice() {
            [] => vec![("media_type", "TEXT".to_string())],
            [single] => Self::media_fields(single),
            many => {
                let children = try_join_all(many.iter().map(|media| {
                    let mut form = Self::media_fields(media);
                    form.push(("is_carousel_item", "true".to_string()));
                    self.container(id, access_token, form)
                }))
                .await?;
                vec![
                    ("media_type", "CAROUSEL".to_string()),
                    ("children", children.join(",")),
                ]
            }
        };
        form.push(("text", text));
        if let Some(parent) = reply_to {
            form.push(("reply_to_id", parent.to_string()));
        }
        let container = self.container(id, access_token, form).await?;

        let request = self
            .http
            .client()
            .post(self.url(&format!("/v1.0/{}/threads_publish", id)))
            .form(&[("creation_id", container.as_str()), ("access_token", access_token)]);
        let published: Created = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        let request = self
            .http
            .client()
            .get(self.url(&format!("/v1.0/{}", published.id)))
            .query(&[("fields", "id,permalink"), ("access_token", access_token)]);
        let permalink: Permalink = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok((published.id, permalink.permalink.unwrap_or_default()))
    }

    async fn likes(&self, post_id: &str, access_token: &str) -> Result<u64> {
        let request = self
            .http
            .client()
            .get(self.url(&format!("/v1.0/{}/insights", post_id)))
            .query(&[("metric", "likes"), ("access_token", access_token)]);
        let insights: Insights = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok(insights
            .data
            .iter()
            .find(|metric| metric.get("name").and_then(|n| n.as_str()) == Some("likes"))
            .and_then(|metric| metric.pointer("/values/0/value"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }
}

#[async_trait]
impl SocialProvider for ThreadsProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "Threads"
    }

    fn scopes(&self) -> &[&'static str] {
        SCOPES
    }

    fn max_concurrent_job(&self) -> usize {
        2
    }

    fn max_length(&self, _additional_settings: &Value) -> usize {
        500
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.redirect_uri(IDENTIFIER).as_str()),
                ("response_type", "code"),
                ("scope", SCOPES.join(",").as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| ProviderError::Validation(format!("Invalid Threads URL: {}", e)))?;

        Ok(GenerateAuthUrlResponse {
            url: url.to_string(),
            code_verifier: make_id(VERIFIER_LENGTH),
            state,
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        let redirect_uri = self.app.redirect_uri(IDENTIFIER);
        let request = self.http.client().get(self.url("/oauth/access_token")).query(&[
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri.as_str()),
            ("code", params.code.as_str()),
        ]);
        let short: Token = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        let request = self.http.client().get(self.url("/access_token")).query(&[
            ("grant_type", "th_exchange_token"),
            ("client_secret", self.app.client_secret.expose_secret()),
            ("access_token", short.access_token.as_str()),
        ]);
        let long: Token = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        // The token response does not list granted scopes
        let request = self.http.client().get(self.url("/v1.0/me/permissions")).query(&[
            ("access_token", long.access_token.as_str()),
        ]);
        let response = self.http.fetch(IDENTIFIER, request, classify).await?;
        let permissions: Value = response.json().await?;
        let granted = permissions
            .get("data")
            .and_then(|d| d.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter(|p| p.get("status").and_then(|s| s.as_str()) == Some("granted"))
                    .filter_map(|p| p.get("permission").and_then(|s| s.as_str()))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        check_scopes(SCOPES, &granted)?;

        self.profile(&long.access_token, long.expires_in).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        let request = self.http.client().get(self.url("/refresh_access_token")).query(&[
            ("grant_type", "th_refresh_token"),
            ("access_token", refresh_token),
        ]);
        let token: Token = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        self.profile(&token.access_token, token.expires_in).await
    }

    async fn post(
        &self,
        id: &str,
        access_token: &str,
        posts: &[PostDetails],
        _integration: &Integration,
    ) -> Result<Vec<PostResponse>> {
        let mut responses = Vec::with_capacity(posts.len());
        let mut parent: Option<String> = None;

        let result = async {
            for post in posts {
                let (media_id, permalink) = self
                    .publish(id, access_token, post, parent.as_deref())
                    .await?;
                info!(media_id = %media_id, "Published to Threads");
                responses.push(PostResponse::posted(&post.id, &media_id, permalink));
                parent = Some(media_id);
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
            .get(self.url(&format!("/v1.0/{}/threads_insights", id)))
            .query(&[
                ("metric", "views,likes,replies,reposts,quotes".to_string()),
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

    async fn auto_plug_post(
        &self,
        integration: &Integration,
        post_id: &str,
        min_likes: u64,
        message: &str,
    ) -> Result<bool> {
        let likes = self.likes(post_id, &integration.token).await?;
        if likes < min_likes {
            return Ok(false);
        }

        let plug = PostDetails::new(post_id, message);
        self.publish(&integration.internal_id, &integration.token, &plug, Some(post_id))
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> ThreadsProvider {
        let app = OAuthApp::new("th-client", "th-secret", "https://app.example.com");
        let http = ProviderHttp::new(crate::providers::RetryPolicy::new(1, Duration::from_millis(1)));
        ThreadsProvider::new(app, http)
            .with_api_url(server.uri())
            .with_poll_policy(PollPolicy::new(Duration::from_millis(1), 5))
    }

    async fn mount_ready(server: &MockServer) {
        Mock::given(method("GET"))
            .and(query_param("fields", "status,error_message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "FINISHED"})))
            .mount(server)
            .await;
    }

    async fn mount_published(server: &MockServer, container: &str, media_id: &str) {
        Mock::given(method("POST"))
            .and(path("/v1.0/42/threads_publish"))
            .and(body_string_contains(format!("creation_id={}&", container)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": media_id})))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v1.0/{}", media_id)))
            .and(query_param("fields", "id,permalink"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": media_id,
                "permalink": format!("https://www.threads.net/@studio/post/{}", media_id)
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_generate_auth_url() {
        let provider = ThreadsProvider::new(
            OAuthApp::new("th-client", "th-secret", "https://app.example.com"),
            ProviderHttp::new(crate::providers::RetryPolicy::new(0, Duration::from_millis(1))),
        );
        let auth = provider.generate_auth_url().unwrap();

        let url = Url::parse(&auth.url).unwrap();
        assert_eq!(url.host_str(), Some("threads.net"));
        assert_eq!(url.path(), "/oauth/authorize");
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["client_id"], "th-client");
        assert_eq!(query["response_type"], "code");
        assert_eq!(
            query["redirect_uri"],
            "https://app.example.com/integrations/social/threads"
        );
        assert_eq!(query["scope"], SCOPES.join(","));
        assert_eq!(query["state"], auth.state);
        assert!(!auth.code_verifier.is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_checks_permissions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/access_token"))
            .and(query_param("code", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "short", "user_id": 42
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/access_token"))
            .and(query_param("grant_type", "th_exchange_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "long", "expires_in": 5183944
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/permissions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [
                {"permission": "threads_basic", "status": "granted"},
                {"permission": "threads_content_publish", "status": "granted"},
                {"permission": "threads_manage_replies", "status": "declined"}
            ]})))
            .mount(&server)
            .await;

        let err = provider(&server)
            .authenticate(&AuthenticateParams::code("abc"))
            .await
            .unwrap_err();
        match err.as_provider() {
            Some(ProviderError::NotEnoughScopes(missing)) => {
                assert!(missing.contains(&"threads_manage_replies".to_string()));
                assert!(missing.contains(&"threads_manage_insights".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/refresh_access_token"))
            .and(query_param("grant_type", "th_refresh_token"))
            .and(query_param("access_token", "old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new", "expires_in": 5183944
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "42", "username": "studio"
            })))
            .mount(&server)
            .await;

        let details = provider(&server).refresh_token("old").await.unwrap();
        assert_eq!(details.access_token, "new");
        assert_eq!(details.name, "studio");
    }

    #[tokio::test]
    async fn test_thread_replies_chain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/42/threads"))
            .and(body_string_contains("text=first"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/42/threads"))
            .and(body_string_contains("text=second"))
            .and(body_string_contains("reply_to_id=m1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c2"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_ready(&server).await;
        mount_published(&server, "c1", "m1").await;
        mount_published(&server, "c2", "m2").await;

        let posts = vec![PostDetails::new("a", "first"), PostDetails::new("b", "second")];
        let responses = provider(&server)
            .post("42", "token", &posts, &Integration::default())
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].post_id, "m1");
        assert_eq!(responses[1].post_id, "m2");
        assert_eq!(responses[1].release_url, "https://www.threads.net/@studio/post/m2");
    }

    #[tokio::test]
    async fn test_post_polls_container_until_finished() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/42/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/c1"))
            .and(query_param("fields", "status,error_message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "IN_PROGRESS"})))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/c1"))
            .and(query_param("fields", "status,error_message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "FINISHED"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_published(&server, "c1", "m1").await;

        let responses = provider(&server)
            .post("42", "token", &[PostDetails::new("a", "first")], &Integration::default())
            .await
            .unwrap();
        assert_eq!(responses[0].post_id, "m1");
    }

    #[tokio::test]
    async fn test_post_failed_container_reports_vendor_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/42/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ERROR",
                "error_message": "Video aspect ratio is not supported"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/42/threads_publish"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
            .expect(0)
            .mount(&server)
            .await;

        let err = provider(&server)
            .post("42", "token", &[PostDetails::new("a", "first")], &Integration::default())
            .await
            .unwrap_err();
        match err.as_provider() {
            Some(ProviderError::JobFailed { message, .. }) => {
                assert_eq!(message, "Video aspect ratio is not supported");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_plug_below_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/m1/insights"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [
                {"name": "likes", "values": [{"value": 3}]}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let integration = Integration {
            internal_id: "42".to_string(),
            token: "token".to_string(),
            ..Default::default()
        };
        let plugged = provider(&server)
            .auto_plug_post(&integration, "m1", 10, "Check this out")
            .await
            .unwrap();
        assert!(!plugged);
    }
}
