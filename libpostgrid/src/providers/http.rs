//! Shared HTTP behavior for provider adapters
//!
//! Adapters compose a [`ProviderHttp`] instead of inheriting from a base
//! class. It owns the retry loop, the mapping of vendor failures onto
//! [`ProviderError`], and the bounded polling used by async media jobs.

use std::future::Future;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{parse_duration, PollConfig, ProviderConfig, RetryConfig};
use crate::error::{ProviderError, Result};
use crate::types::{HandledError, HandledErrorKind};

/// Maps a raw vendor error body onto a caller-actionable hint
pub type Classifier = fn(&str) -> Option<HandledError>;

/// Classifier for adapters that do not recognize any vendor error shapes
pub fn no_classification(_body: &str) -> Option<HandledError> {
    None
}

/// Length of the OAuth `state` parameter
pub const STATE_LENGTH: usize = 16;
/// Length of PKCE code verifiers
pub const VERIFIER_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Ok(Self {
            max_retries: config.max_retries,
            delay: parse_duration("retry.delay", &config.delay)?,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// How an unsuccessful response should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    Retry,
    RefreshToken(String),
    BadBody(String),
}

/// Decide what to do with a non-2xx response
pub(crate) fn classify_failure(status: u16, body: &str, classify: Classifier) -> Failure {
    if status == 429
        || status == 500
        || body.contains("rate_limit_exceeded")
        || body.contains("Rate limit")
    {
        return Failure::Retry;
    }

    match classify(body) {
        Some(HandledError {
            kind: HandledErrorKind::Retry,
            ..
        }) => Failure::Retry,
        Some(HandledError {
            kind: HandledErrorKind::RefreshToken,
            value,
        }) => Failure::RefreshToken(value),
        Some(HandledError {
            kind: HandledErrorKind::BadBody,
            value,
        }) => Failure::BadBody(value),
        None if status == 401 => Failure::RefreshToken(String::new()),
        None => Failure::BadBody(String::new()),
    }
}

#[derive(Debug, Clone)]
pub struct ProviderHttp {
    client: Client,
    retry: RetryPolicy,
}

impl ProviderHttp {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            retry,
        }
    }

    pub fn with_client(client: Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Send a request, retrying rate limits and transient vendor failures
    ///
    /// Returns the response on any 2xx status. Failures are mapped to
    /// [`ProviderError::RefreshToken`] or [`ProviderError::BadBody`]; the
    /// latter carries the classified message, the vendor body and the
    /// request body.
    pub async fn fetch(
        &self,
        identifier: &str,
        request: RequestBuilder,
        classify: Classifier,
    ) -> Result<Response> {
        let mut retries = 0;
        loop {
            let attempt = request.try_clone().ok_or_else(|| {
                ProviderError::Posting(format!(
                    "{} request body cannot be replayed, use fetch_once",
                    identifier
                ))
            })?;

            match self.send(identifier, attempt, classify).await? {
                Outcome::Success(response) => return Ok(response),
                Outcome::Retry { body, .. } if retries < self.retry.max_retries => {
                    retries += 1;
                    warn!(
                        provider = identifier,
                        "Retryable failure (retry {}/{}), waiting {:?}: {}",
                        retries,
                        self.retry.max_retries,
                        self.retry.delay,
                        truncate(&body)
                    );
                    sleep(self.retry.delay).await;
                }
                Outcome::Retry { body, request } => {
                    return Err(ProviderError::BadBody {
                        identifier: identifier.to_string(),
                        message: format!("Gave up after {} retries", self.retry.max_retries),
                        body,
                        request,
                    }
                    .into());
                }
            }
        }
    }

    /// Send a request exactly once
    ///
    /// Used for multipart uploads whose bodies cannot be cloned. A
    /// retryable failure is reported as [`ProviderError::RateLimit`].
    pub async fn fetch_once(
        &self,
        identifier: &str,
        request: RequestBuilder,
        classify: Classifier,
    ) -> Result<Response> {
        match self.send(identifier, request, classify).await? {
            Outcome::Success(response) => Ok(response),
            Outcome::Retry { body, .. } => {
                Err(ProviderError::RateLimit(format!("{}: {}", identifier, truncate(&body))).into())
            }
        }
    }

    async fn send(
        &self,
        identifier: &str,
        request: RequestBuilder,
        classify: Classifier,
    ) -> Result<Outcome> {
        let (client, request) = request.build_split();
        let request = request?;
        let request_body = request
            .body()
            .and_then(|body| body.as_bytes())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();

        debug!(provider = identifier, method = %request.method(), url = %request.url(), "Sending request");
        let response = client.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Outcome::Success(response));
        }

        let body = response.text().await.unwrap_or_default();
        match classify_failure(status.as_u16(), &body, classify) {
            Failure::Retry => Ok(Outcome::Retry {
                body,
                request: request_body,
            }),
            Failure::RefreshToken(message) => {
                warn!(provider = identifier, status = status.as_u16(), "Token rejected");
                Err(ProviderError::RefreshToken {
                    identifier: identifier.to_string(),
                    message,
                    body,
                }
                .into())
            }
            Failure::BadBody(message) => {
                warn!(provider = identifier, status = status.as_u16(), "Request rejected: {}", truncate(&body));
                Err(ProviderError::BadBody {
                    identifier: identifier.to_string(),
                    message,
                    body,
                    request: request_body,
                }
                .into())
            }
        }
    }

    /// Download hosted media so it can be re-uploaded to a network
    pub async fn download(&self, url: &str) -> Result<DownloadedMedia> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let bytes = response.bytes().await?.to_vec();
        let content_type = mime_from_path(url)
            .map(|m| m.to_string())
            .or(header_type)
            .unwrap_or_else(|| "application/octet-stream".to_string());

        debug!(url, size = bytes.len(), %content_type, "Downloaded media");
        Ok(DownloadedMedia {
            bytes,
            content_type,
            file_name: file_name(url),
        })
    }
}

enum Outcome {
    Success(Response),
    Retry { body: String, request: String },
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

impl DownloadedMedia {
    pub fn is_video(&self) -> bool {
        self.content_type.starts_with("video/")
    }
}

/// Guess a MIME type from a URL or file path extension
pub fn mime_from_path(path: &str) -> Option<&'static str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let extension = path.rsplit_once('.')?.1.to_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "mp4" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        _ => None,
    }
}

fn file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("media")
        .to_string()
}

/// Fail with [`ProviderError::NotEnoughScopes`] unless every required scope was granted
///
/// `granted` is the vendor's scope string, separated by commas or whitespace.
pub fn check_scopes(required: &[&str], granted: &str) -> Result<()> {
    let granted: Vec<&str> = granted
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();

    let missing: Vec<String> = required
        .iter()
        .filter(|scope| !granted.contains(scope))
        .map(|scope| scope.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::NotEnoughScopes(missing).into())
    }
}

/// Random alphanumeric identifier used for OAuth state and PKCE verifiers
pub fn make_id(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// S256 code challenge for a PKCE verifier
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Bounds for polling a vendor job until it reaches a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn from_config(config: &PollConfig) -> Result<Self> {
        Ok(Self::new(config.interval()?, config.max_attempts))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Pending,
    Done(T),
    Failed(String),
}

/// Poll `check` until it reports a terminal state
///
/// Sleeps `policy.interval` between checks. Running out of attempts yields
/// [`ProviderError::PollTimeout`]; a vendor failure state yields
/// [`ProviderError::JobFailed`].
pub async fn poll_until<T, F, Fut>(identifier: &str, policy: PollPolicy, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>>>,
{
    for attempt in 1..=policy.max_attempts {
        match check().await? {
            PollState::Done(value) => {
                debug!(provider = identifier, attempt, "Job finished");
                return Ok(value);
            }
            PollState::Failed(message) => {
                warn!(provider = identifier, attempt, "Job failed: {}", message);
                return Err(ProviderError::JobFailed {
                    identifier: identifier.to_string(),
                    message,
                }
                .into());
            }
            PollState::Pending => {
                debug!(provider = identifier, attempt, "Job still processing");
                if attempt < policy.max_attempts {
                    sleep(policy.interval).await;
                }
            }
        }
    }

    Err(ProviderError::PollTimeout {
        identifier: identifier.to_string(),
        attempts: policy.max_attempts,
    }
    .into())
}

/// OAuth application credentials for one provider
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: SecretString,
    pub frontend_url: String,
}

impl OAuthApp {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            frontend_url: frontend_url.into(),
        }
    }

    pub fn from_config(config: &ProviderConfig, frontend_url: &str) -> Self {
        Self::new(
            config.client_id.clone(),
            config.client_secret.clone(),
            frontend_url,
        )
    }

    /// Where the vendor sends the user back after consent
    pub fn redirect_uri(&self, identifier: &str) -> String {
        format!(
            "{}/integrations/social/{}",
            self.frontend_url.trim_end_matches('/'),
            identifier
        )
    }
}
