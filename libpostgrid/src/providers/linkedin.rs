//! LinkedIn adapter
//!
//! Posts go to the versioned `/rest/posts` API; every item after the first
//! becomes a comment on the first post.

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{RequestBuilder, Url};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::http::{
    check_scopes, make_id, no_classification, OAuthApp, ProviderHttp, STATE_LENGTH,
    VERIFIER_LENGTH,
};
use super::{finish_chain, strip_html, SocialProvider};
use crate::error::{PostgridError, ProviderError, Result};
use crate::types::{
    AuthTokenDetails, AuthenticateParams, GenerateAuthUrlResponse, Integration, MediaContent,
    PostDetails, PostResponse,
};

pub const IDENTIFIER: &str = "linkedin";

const SCOPES: &[&str] = &["openid", "profile", "w_member_social"];
const DEFAULT_API_URL: &str = "https://api.linkedin.com";
const DEFAULT_OAUTH_URL: &str = "https://www.linkedin.com";
const LINKEDIN_VERSION: &str = "202501";

pub struct LinkedInProvider {
    app: OAuthApp,
    http: ProviderHttp,
    api_url: String,
    oauth_url: String,
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
struct UserInfo {
    sub: String,
    name: String,
    #[serde(default)]
    picture: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Me {
    #[serde(default)]
    vanity_name: Option<String>,
}

#[derive(Deserialize)]
struct Initialized<T> {
    value: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageUpload {
    upload_url: String,
    image: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoUpload {
    video: String,
    #[serde(default)]
    upload_token: String,
    upload_instructions: Vec<UploadInstruction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadInstruction {
    upload_url: String,
    first_byte: usize,
    last_byte: usize,
}

#[derive(Deserialize)]
struct CreatedComment {
    id: String,
}

/// Escape characters that LinkedIn's "little text" format treats as markup
///
/// Mentions of the form `@[Name](urn:li:...)` are left intact.
pub fn escape_commentary(text: &str) -> String {
    use std::sync::OnceLock;

    static MENTION: OnceLock<regex::Regex> = OnceLock::new();
    let mention = MENTION
        .get_or_init(|| regex::Regex::new(r"@\[[^\]]+\]\(urn:li:[^)]+\)").expect("Valid regex"));

    let mut escaped = String::with_capacity(text.len());
    let mut last = 0;
    for found in mention.find_iter(text) {
        escape_into(&text[last..found.start()], &mut escaped);
        escaped.push_str(found.as_str());
        last = found.end();
    }
    escape_into(&text[last..], &mut escaped);
    escaped
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '|' | '{' | '}' | '@' | '[' | ']' | '(' | ')' | '<' | '>' | '#' | '*' | '_' | '~'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
}

impl LinkedInProvider {
    pub fn new(app: OAuthApp, http: ProviderHttp) -> Self {
        Self {
            app,
            http,
            api_url: DEFAULT_API_URL.to_string(),
            oauth_url: DEFAULT_OAUTH_URL.to_string(),
        }
    }

    /// Point both the REST API and the OAuth endpoints at `url`
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.oauth_url = url.clone();
        self.api_url = url;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }

    fn rest(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder {
        request
            .bearer_auth(access_token)
            .header("LinkedIn-Version", LINKEDIN_VERSION)
            .header("X-Restli-Protocol-Version", "2.0.0")
    }

    async fn exchange(&self, form: &[(&str, &str)]) -> Result<AuthTokenDetails> {
        let request = self
            .http
            .client()
            .post(format!(
                "{}/oauth/v2/accessToken",
                self.oauth_url.trim_end_matches('/')
            ))
            .form(form);
        let token: TokenResponse = self
            .http
            .fetch(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?;

        check_scopes(SCOPES, &token.scope)?;

        let request = self
            .http
            .client()
            .get(self.url("/v2/userinfo"))
            .bearer_auth(&token.access_token);
        let user: UserInfo = self
            .http
            .fetch(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?;

        let request = self
            .http
            .client()
            .get(self.url("/v2/me"))
            .bearer_auth(&token.access_token);
        let me: Me = self
            .http
            .fetch(IDENTIFIER, request, no_classification)
            .await?
            .json()
            .await?;

        Ok(AuthTokenDetails {
            id: user.sub,
            name: user.name,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
            picture: user.picture,
            username: me.vanity_name.unwrap_or_default(),
            additional_settings: None,
        })
    }

    async fn upload_media(
        &self,
        access_token: &str,
        author: &str,
        media: &MediaContent,
    ) -> Result<String> {
        let file = self.http.download(&media.path).await?;

        if !file.is_video() {
            let request = self.rest(
                self.http
                    .client()
                    .post(self.url("/rest/images?action=initializeUpload")),
                access_token,
            );
            let init: Initialized<ImageUpload> = self
                .http
                .fetch(
                    IDENTIFIER,
                    request.json(&json!({"initializeUploadRequest": {"owner": author}})),
                    no_classification,
                )
                .await?
                .json()
                .await?;

            let upload = self
                .http
                .client()
                .put(&init.value.upload_url)
                .bearer_auth(access_token)
                .header(reqwest::header::CONTENT_TYPE, file.content_type.as_str())
                .body(file.bytes);
            self.http
                .fetch(IDENTIFIER, upload, no_classification)
                .await?;
            return Ok(init.value.image);
        }

        let request = self.rest(
            self.http
                .client()
                .post(self.url("/rest/videos?action=initializeUpload")),
            access_token,
        );
        let init: Initialized<VideoUpload> = self
            .http
            .fetch(
                IDENTIFIER,
                request.json(&json!({"initializeUploadRequest": {
                    "owner": author,
                    "fileSizeBytes": file.bytes.len(),
                    "uploadCaptions": false,
                    "uploadThumbnail": false,
                }})),
                no_classification,
            )
            .await?
            .json()
            .await?;

        let mut etags = Vec::with_capacity(init.value.upload_instructions.len());
        for part in &init.value.upload_instructions {
            let end = (part.last_byte + 1).min(file.bytes.len());
            let chunk = file.bytes[part.first_byte.min(end)..end].to_vec();
            let upload = self
                .http
                .client()
                .put(&part.upload_url)
                .bearer_auth(access_token)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(chunk);
            let response = self
                .http
                .fetch(IDENTIFIER, upload, no_classification)
                .await?;
            let etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            etags.push(etag);
        }

        let request = self.rest(
            self.http
                .client()
                .post(self.url("/rest/videos?action=finalizeUpload")),
            access_token,
        );
        self.http
            .fetch(
                IDENTIFIER,
                request.json(&json!({"finalizeUploadRequest": {
                    "video": init.value.video,
                    "uploadToken": init.value.upload_token,
                    "uploadedPartIds": etags,
                }})),
                no_classification,
            )
            .await?;

        Ok(init.value.video)
    }

    fn content(media: &[MediaContent], urns: Vec<String>) -> Option<serde_json::Value> {
        match urns.len() {
            0 => None,
            1 => {
                let mut single = json!({ "id": urns[0] });
                if let Some(alt) = media.first().and_then(|m| m.alt.as_deref()) {
                    single["altText"] = json!(alt);
                }
                Some(json!({ "media": single }))
            }
            _ => Some(json!({
                "multiImage": {
                    "images": urns.into_iter().map(|id| json!({ "id": id })).collect::<Vec<_>>()
                }
            })),
        }
    }
}

#[async_trait]
impl SocialProvider for LinkedInProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "LinkedIn"
    }

    fn scopes(&self) -> &[&'static str] {
        SCOPES
    }

    fn max_concurrent_job(&self) -> usize {
        2
    }

    fn max_length(&self, _additional_settings: &serde_json::Value) -> usize {
        3000
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        let url = Url::parse_with_params(
            &format!(
                "{}/oauth/v2/authorization",
                self.oauth_url.trim_end_matches('/')
            ),
            &[
                ("response_type", "code"),
                ("client_id", self.app.client_id.as_str()),
                ("prompt", "none"),
                ("redirect_uri", self.app.redirect_uri(IDENTIFIER).as_str()),
                ("state", state.as_str()),
                ("scope", SCOPES.join(" ").as_str()),
            ],
        )
        .map_err(|e| ProviderError::Validation(format!("Invalid LinkedIn URL: {}", e)))?;

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
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        self.exchange(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.expose_secret()),
        ])
        .await
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
        let author = format!("urn:li:person:{}", id);

        let urns = try_join_all(
            first
                .media
                .iter()
                .map(|media| self.upload_media(access_token, &author, media)),
        )
        .await?;

        let mut body = json!({
            "author": author,
            "commentary": escape_commentary(&strip_html(&first.message)),
            "visibility": "PUBLIC",
            "distribution": {
                "feedDistribution": "MAIN_FEED",
                "targetEntities": [],
                "thirdPartyDistributionChannels": []
            },
            "lifecycleState": "PUBLISHED",
            "isReshareDisabledByAuthor": false
        });
        if let Some(content) = Self::content(&first.media, urns) {
            body["content"] = content;
        }

        let request = self.rest(self.http.client().post(self.url("/rest/posts")), access_token);
        let response = self
            .http
            .fetch(IDENTIFIER, request.json(&body), no_classification)
            .await?;
        let top_urn = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| {
                ProviderError::Posting("LinkedIn did not return a post id".to_string())
            })?;

        info!(urn = %top_urn, "Published to LinkedIn");
        let release_url = format!("https://www.linkedin.com/feed/update/{}", top_urn);
        let mut responses = vec![PostResponse::posted(&first.id, &top_urn, &release_url)];

        let result = async {
            for comment in comments {
                let request = self.rest(
                    self.http
                        .client()
                        .post(self.url(&format!("/v2/socialActions/{}/comments", top_urn))),
                    access_token,
                );
                let created: CreatedComment = self
                    .http
                    .fetch(
                        IDENTIFIER,
                        request.json(&json!({
                            "actor": author,
                            "object": top_urn,
                            "message": { "text": strip_html(&comment.message) }
                        })),
                        no_classification,
                    )
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
}
