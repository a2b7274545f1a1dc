//! Discord adapter
//!
//! Installing the app adds the bot to a server; the integration is bound to
//! that server and messages are sent with the bot token. Follow-up items are
//! posted in a thread started from the first message.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::http::{make_id, OAuthApp, ProviderHttp, STATE_LENGTH, VERIFIER_LENGTH};
use super::{finish_chain, SocialProvider};
use crate::error::{PostgridError, ProviderError, Result};
use crate::types::{
    AuthTokenDetails, AuthenticateParams, GenerateAuthUrlResponse, HandledError, Integration,
    MentionCandidate, PostDetails, PostResponse,
};

pub const IDENTIFIER: &str = "discord";

const SCOPES: &[&str] = &["identify", "guilds", "bot"];
/// Send messages, attach files, create and post in threads
const BOT_PERMISSIONS: &str = "377957124096";
const DEFAULT_API_URL: &str = "https://discord.com/api";
const DEFAULT_AUTHORIZE_URL: &str = "https://discord.com/oauth2/authorize";
const CDN_URL: &str = "https://cdn.discordapp.com";

/// Text and announcement channels accept messages
const POSTABLE_CHANNEL_TYPES: &[u64] = &[0, 5];

pub fn classify(body: &str) -> Option<HandledError> {
    if body.contains("Missing Access") || body.contains("50001") {
        return Some(HandledError::bad_body(
            "The bot has no access to this channel, check its role",
        ));
    }
    if body.contains("Missing Permissions") || body.contains("50013") {
        return Some(HandledError::bad_body(
            "The bot is missing permissions in this channel",
        ));
    }
    if body.contains("Unknown Channel") || body.contains("10003") {
        return Some(HandledError::bad_body("The selected channel no longer exists"));
    }
    if body.contains("Request entity too large") || body.contains("40005") {
        return Some(HandledError::bad_body("Attachment is too large for this server"));
    }
    None
}

#[derive(Debug, Default, Deserialize)]
pub struct DiscordSettings {
    #[serde(default)]
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscordChannel {
    pub id: String,
    pub name: String,
}

pub struct DiscordProvider {
    app: OAuthApp,
    http: ProviderHttp,
    bot_token: SecretString,
    api_url: String,
    authorize_url: String,
}

#[derive(Deserialize)]
struct Token {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    guild: Option<Guild>,
}

#[derive(Deserialize)]
struct Guild {
    id: String,
    name: String,
    #[serde(default)]
    icon: Option<String>,
}

#[derive(Deserialize)]
struct Me {
    application: Application,
}

#[derive(Deserialize)]
struct Application {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct Channel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: u64,
}

#[derive(Deserialize)]
struct Message {
    id: String,
    channel_id: String,
}

#[derive(Deserialize)]
struct Member {
    user: MemberUser,
    #[serde(default)]
    nick: Option<String>,
}

#[derive(Deserialize)]
struct MemberUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

fn guild_icon(guild: &Guild) -> Option<String> {
    guild
        .icon
        .as_ref()
        .map(|icon| format!("{}/icons/{}/{}.png", CDN_URL, guild.id, icon))
}

impl DiscordProvider {
    pub fn new(app: OAuthApp, http: ProviderHttp, bot_token: impl Into<String>) -> Self {
        Self {
            app,
            http,
            bot_token: SecretString::from(bot_token.into()),
            api_url: DEFAULT_API_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }

    fn bot_header(&self) -> String {
        format!("Bot {}", self.bot_token.expose_secret())
    }

    async fn exchange(&self, form: &[(&str, &str)]) -> Result<AuthTokenDetails> {
        let request = self
            .http
            .client()
            .post(self.url("/oauth2/token"))
            .basic_auth(&self.app.client_id, Some(self.app.client_secret.expose_secret()))
            .form(form);
        let token: Token = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        let request = self
            .http
            .client()
            .get(self.url("/oauth2/@me"))
            .bearer_auth(&token.access_token);
        let me: Me = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        // Refreshes do not carry the guild; the caller keeps the original binding
        let (id, picture) = match &token.guild {
            Some(guild) => (guild.id.clone(), guild_icon(guild)),
            None => (me.application.id.clone(), None),
        };
        let name = token
            .guild
            .as_ref()
            .map(|g| g.name.clone())
            .unwrap_or_else(|| me.application.name.clone());

        Ok(AuthTokenDetails {
            id,
            name,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
            picture,
            username: me.application.name,
            additional_settings: None,
        })
    }

    /// Channels of `guild_id` the bot can post to
    pub async fn list_channels(&self, guild_id: &str) -> Result<Vec<DiscordChannel>> {
        let request = self
            .http
            .client()
            .get(self.url(&format!("/guilds/{}/channels", guild_id)))
            .header("Authorization", self.bot_header());
        let channels: Vec<Channel> = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok(channels
            .into_iter()
            .filter(|c| POSTABLE_CHANNEL_TYPES.contains(&c.kind))
            .map(|c| DiscordChannel {
                name: c.name.unwrap_or_else(|| c.id.clone()),
                id: c.id,
            })
            .collect())
    }

    async fn send_message(&self, channel: &str, post: &PostDetails) -> Result<Message> {
        let url = self.url(&format!("/channels/{}/messages", channel));
        let payload = json!({ "content": post.message });

        let response = if post.media.is_empty() {
            let request = self
                .http
                .client()
                .post(url)
                .header("Authorization", self.bot_header())
                .json(&payload);
            self.http.fetch(IDENTIFIER, request, classify).await?
        } else {
            let mut form = Form::new().text("payload_json", payload.to_string());
            for (index, media) in post.media.iter().enumerate() {
                let file = self.http.download(&media.path).await?;
                let part = Part::bytes(file.bytes)
                    .file_name(file.file_name)
                    .mime_str(&file.content_type)
                    .map_err(|e| ProviderError::Validation(format!("Invalid media type: {}", e)))?;
                form = form.part(format!("files[{}]", index), part);
            }
            let request = self
                .http
                .client()
                .post(url)
                .header("Authorization", self.bot_header())
                .multipart(form);
            self.http.fetch_once(IDENTIFIER, request, classify).await?
        };

        Ok(response.json().await?)
    }

    async fn start_thread(&self, channel: &str, message_id: &str, name: &str) -> Result<String> {
        let request = self
            .http
            .client()
            .post(self.url(&format!("/channels/{}/messages/{}/threads", channel, message_id)))
            .header("Authorization", self.bot_header())
            .json(&json!({ "name": name, "auto_archive_duration": 1440 }));
        let thread: Channel = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;
        Ok(thread.id)
    }
}

/// Thread names are limited to 100 characters
fn thread_name(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default().trim();
    let name: String = first_line.chars().take(100).collect();
    if name.is_empty() {
        "Thread".to_string()
    } else {
        name
    }
}

#[async_trait]
impl SocialProvider for DiscordProvider {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn name(&self) -> &str {
        "Discord"
    }

    fn scopes(&self) -> &[&'static str] {
        SCOPES
    }

    fn max_concurrent_job(&self) -> usize {
        5
    }

    fn max_length(&self, _additional_settings: &Value) -> usize {
        1980
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("client_id", self.app.client_id.as_str()),
                ("permissions", BOT_PERMISSIONS),
                ("response_type", "code"),
                ("redirect_uri", self.app.redirect_uri(IDENTIFIER).as_str()),
                ("integration_type", "0"),
                ("scope", SCOPES.join(" ").as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| ProviderError::Validation(format!("Invalid Discord URL: {}", e)))?;

        Ok(GenerateAuthUrlResponse {
            url: url.to_string(),
            code_verifier: make_id(VERIFIER_LENGTH),
            state,
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        let redirect_uri = self.app.redirect_uri(IDENTIFIER);
        self.exchange(&[
            ("code", params.code.as_str()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        self.exchange(&[
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn post(
        &self,
        id: &str,
        _access_token: &str,
        posts: &[PostDetails],
        _integration: &Integration,
    ) -> Result<Vec<PostResponse>> {
        let Some((first, rest)) = posts.split_first() else {
            return Ok(Vec::new());
        };
        let settings: DiscordSettings = first.settings()?;
        if settings.channel.is_empty() {
            return Err(ProviderError::Validation("A Discord channel must be selected".to_string()).into());
        }

        let message = self.send_message(&settings.channel, first).await?;
        info!(message_id = %message.id, channel = %message.channel_id, "Posted to Discord");
        let mut responses = vec![PostResponse::posted(
            &first.id,
            &message.id,
            format!("https://discord.com/channels/{}/{}/{}", id, message.channel_id, message.id),
        )];

        let result = async {
            if !rest.is_empty() {
                let thread = self
                    .start_thread(&settings.channel, &message.id, &thread_name(&first.message))
                    .await?;
                for post in rest {
                    let reply = self.send_message(&thread, post).await?;
                    responses.push(PostResponse::posted(
                        &post.id,
                        &reply.id,
                        format!("https://discord.com/channels/{}/{}/{}", id, thread, reply.id),
                    ));
                }
            }
            Ok::<_, PostgridError>(())
        }
        .await;

        finish_chain(responses, result)
    }

    async fn mention(
        &self,
        _access_token: &str,
        query: &str,
        integration: &Integration,
    ) -> Result<Vec<MentionCandidate>> {
        let request = self
            .http
            .client()
            .get(self.url(&format!("/guilds/{}/members/search", integration.internal_id)))
            .query(&[("query", query), ("limit", "10")])
            .header("Authorization", self.bot_header());
        let members: Vec<Member> = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok(members
            .into_iter()
            .map(|member| {
                let image = member
                    .user
                    .avatar
                    .as_ref()
                    .map(|avatar| format!("{}/avatars/{}/{}.png", CDN_URL, member.user.id, avatar))
                    .unwrap_or_default();
                MentionCandidate {
                    label: member
                        .nick
                        .or(member.user.global_name)
                        .unwrap_or(member.user.username),
                    id: member.user.id,
                    image,
                }
            })
            .collect())
    }

    async fn re_connect(
        &self,
        _id: &str,
        requested_id: &str,
        access_token: &str,
    ) -> Result<AuthTokenDetails> {
        let request = self
            .http
            .client()
            .get(self.url(&format!("/guilds/{}", requested_id)))
            .header("Authorization", self.bot_header());
        let guild: Guild = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok(AuthTokenDetails {
            id: guild.id.clone(),
            picture: guild_icon(&guild),
            username: guild.name.clone(),
            name: guild.name,
            access_token: access_token.to_string(),
            refresh_token: None,
            expires_in: None,
            additional_settings: None,
        })
    }

    async fn change_nickname(&self, id: &str, _access_token: &str, name: &str) -> Result<String> {
        let request = self
            .http
            .client()
            .patch(self.url(&format!("/guilds/{}/members/@me", id)))
            .header("Authorization", self.bot_header())
            .json(&json!({ "nick": name }));
        let member: Value = self
            .http
            .fetch(IDENTIFIER, request, classify)
            .await?
            .json()
            .await?;

        Ok(member
            .get("nick")
            .and_then(|n| n.as_str())
            .unwrap_or(name)
            .to_string())
    }

    fn handle_errors(&self, body: &str) -> Option<HandledError> {
        classify(body)
    }
}
