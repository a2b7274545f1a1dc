//! Core types shared by provider adapters and the publishing service
//!
//! Everything here serializes in camelCase so payloads stay compatible with
//! the frontend and with stored integration records.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result};

/// Outcome of a successful OAuth or credential exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokenDetails {
    /// Account id on the network
    pub id: String,
    pub name: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_settings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

/// Reference to media that is already hosted somewhere reachable by URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaContent {
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Offset in milliseconds of the frame to use as video cover
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_timestamp: Option<u64>,
}

impl MediaContent {
    pub fn image(path: impl Into<String>) -> Self {
        Self {
            media_type: MediaType::Image,
            path: path.into(),
            alt: None,
            thumbnail: None,
            thumbnail_timestamp: None,
        }
    }

    pub fn video(path: impl Into<String>) -> Self {
        Self {
            media_type: MediaType::Video,
            ..Self::image(path)
        }
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollDetails {
    pub options: Vec<String>,
    pub duration_minutes: u32,
}

/// One logical post; a thread or carousel is a slice of these
///
/// `settings` holds the provider-specific settings object as JSON and is
/// decoded by each adapter with [`PostDetails::settings`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostDetails {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub media: Vec<MediaContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollDetails>,
}

impl PostDetails {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            settings: serde_json::Value::Null,
            media: Vec::new(),
            poll: None,
        }
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_media(mut self, media: Vec<MediaContent>) -> Self {
        self.media = media;
        self
    }

    /// Decode the provider settings; missing settings yield `T::default()`
    pub fn settings<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.settings.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.settings.clone()).map_err(|e| {
            ProviderError::Validation(format!("Invalid settings for post {}: {}", self.id, e))
                .into()
        })
    }
}

/// Per-item publishing outcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostResponse {
    /// Our id of the [`PostDetails`] this response belongs to
    pub id: String,
    /// The id assigned by the network
    pub post_id: String,
    #[serde(rename = "releaseURL")]
    pub release_url: String,
    pub status: String,
}

impl PostResponse {
    pub fn posted(id: &str, post_id: impl Into<String>, release_url: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            post_id: post_id.into(),
            release_url: release_url.into(),
            status: "posted".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsPoint {
    pub total: i64,
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsData {
    pub label: String,
    pub percentage_change: f64,
    pub data: Vec<AnalyticsPoint>,
}

impl AnalyticsData {
    /// Build a series and compute the change between its first and last point
    pub fn from_points(label: impl Into<String>, data: Vec<AnalyticsPoint>) -> Self {
        let percentage_change = match (data.first(), data.last()) {
            (Some(first), Some(last)) if first.total != 0 => {
                ((last.total - first.total) as f64 / first.total as f64) * 100.0
            }
            _ => 0.0,
        };
        Self {
            label: label.into(),
            percentage_change,
            data,
        }
    }
}

/// A connected social account as stored by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: String,
    /// Account id on the network
    pub internal_id: String,
    pub name: String,
    #[serde(default)]
    pub picture: Option<String>,
    pub provider_identifier: String,
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Username / handle on the network
    pub profile: String,
    #[serde(default)]
    pub additional_settings: serde_json::Value,
    /// Raw credential payload for providers that log in with credentials
    #[serde(default)]
    pub custom_instance_details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAuthUrlResponse {
    pub url: String,
    pub code_verifier: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateParams {
    pub code: String,
    #[serde(default)]
    pub code_verifier: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl AuthenticateParams {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.code_verifier = verifier.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HandledErrorKind {
    RefreshToken,
    BadBody,
    Retry,
}

/// Caller-actionable classification of a vendor error body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandledError {
    #[serde(rename = "type")]
    pub kind: HandledErrorKind,
    pub value: String,
}

impl HandledError {
    pub fn refresh_token(value: impl Into<String>) -> Self {
        Self {
            kind: HandledErrorKind::RefreshToken,
            value: value.into(),
        }
    }

    pub fn bad_body(value: impl Into<String>) -> Self {
        Self {
            kind: HandledErrorKind::BadBody,
            value: value.into(),
        }
    }

    pub fn retry(value: impl Into<String>) -> Self {
        Self {
            kind: HandledErrorKind::Retry,
            value: value.into(),
        }
    }
}

/// Result row for @-mention autocompletion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MentionCandidate {
    pub id: String,
    pub label: String,
    pub image: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CustomFieldType {
    Text,
    Password,
}

/// A credential the user must type in for non-OAuth providers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: CustomFieldType,
    pub default_value: String,
    pub validation: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Editor {
    #[default]
    Normal,
    Markdown,
    Html,
}

/// Outcome stored for one item handed to a provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    Published,
    Failed,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Published => "published",
            PublishStatus::Failed => "failed",
        }
    }
}

/// Row of the publish history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublishRecord {
    pub id: Option<i64>,
    pub job_id: String,
    pub integration_id: String,
    pub provider: String,
    pub post_id: String,
    pub network_post_id: Option<String>,
    pub release_url: Option<String>,
    pub status: PublishStatus,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub published_at: i64,
}
