//! Mock provider implementation for testing
//!
//! A configurable in-process provider that can simulate successes, scripted
//! failures, delays and refresh behavior. Used to exercise the publishing
//! service without network access.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use super::http::{make_id, STATE_LENGTH, VERIFIER_LENGTH};
use super::{finish_chain, SocialProvider};
use crate::error::{ProviderError, Result};
use crate::types::{
    AuthTokenDetails, AuthenticateParams, GenerateAuthUrlResponse, Integration, PostDetails,
    PostResponse,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded call to [`SocialProvider::post`]
#[derive(Debug, Clone, PartialEq)]
pub struct PostedCall {
    pub access_token: String,
    pub messages: Vec<String>,
}

/// Configuration for mock provider behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Provider identifier (e.g. "mock-x")
    pub identifier: String,

    /// Declared concurrency limit
    pub max_concurrent: usize,

    /// Declared message length limit
    pub max_length: usize,

    /// Whether refresh_token is supported
    pub supports_refresh: bool,

    /// Delay before completing a post (simulates network latency)
    pub delay: Duration,

    /// Errors returned by successive post calls before posting succeeds
    pub post_failures: Arc<Mutex<VecDeque<ProviderError>>>,

    /// Error returned by every post call once scripted failures run out
    pub post_error: Option<ProviderError>,

    /// Post this many items of each chain, then fail with the error
    pub fail_after: Option<(usize, ProviderError)>,

    /// Error returned by refresh_token
    pub refresh_error: Option<ProviderError>,

    pub post_call_count: Arc<Mutex<usize>>,
    pub refresh_call_count: Arc<Mutex<usize>>,

    /// Posts that have been made (for verification)
    pub posted: Arc<Mutex<Vec<PostedCall>>>,

    /// Posts currently in progress and the highest value seen
    pub in_flight: Arc<Mutex<(usize, usize)>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            identifier: "mock".to_string(),
            max_concurrent: 10,
            max_length: 500,
            supports_refresh: true,
            delay: Duration::from_millis(0),
            post_failures: Arc::new(Mutex::new(VecDeque::new())),
            post_error: None,
            fail_after: None,
            refresh_error: None,
            post_call_count: Arc::new(Mutex::new(0)),
            refresh_call_count: Arc::new(Mutex::new(0)),
            posted: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(Mutex::new((0, 0))),
        }
    }
}

/// Mock provider for testing
pub struct MockProvider {
    config: MockConfig,
}

impl MockProvider {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Create a mock provider that always succeeds
    pub fn success(identifier: &str) -> Self {
        Self::new(MockConfig {
            identifier: identifier.to_string(),
            ..Default::default()
        })
    }

    /// Create a mock provider whose posts always fail with `error`
    pub fn post_failure(identifier: &str, error: ProviderError) -> Self {
        Self::new(MockConfig {
            identifier: identifier.to_string(),
            post_error: Some(error),
            ..Default::default()
        })
    }

    /// Create a mock provider whose first `times` posts fail with `error`
    pub fn failing_times(identifier: &str, times: usize, error: ProviderError) -> Self {
        Self::new(MockConfig {
            identifier: identifier.to_string(),
            post_failures: Arc::new(Mutex::new(std::iter::repeat(error).take(times).collect())),
            ..Default::default()
        })
    }

    /// Create a mock provider that publishes `items` of every chain and then
    /// fails with `error`
    pub fn failing_after(identifier: &str, items: usize, error: ProviderError) -> Self {
        Self::new(MockConfig {
            identifier: identifier.to_string(),
            fail_after: Some((items, error)),
            ..Default::default()
        })
    }

    /// Create a mock provider with a delay and a concurrency limit
    pub fn with_delay(identifier: &str, delay: Duration, max_concurrent: usize) -> Self {
        Self::new(MockConfig {
            identifier: identifier.to_string(),
            delay,
            max_concurrent,
            ..Default::default()
        })
    }

    /// Builder: refresh_token fails with `error`
    pub fn refresh_fails(mut self, error: ProviderError) -> Self {
        self.config.refresh_error = Some(error);
        self
    }

    /// Builder: refresh_token is not supported
    pub fn without_refresh(mut self) -> Self {
        self.config.supports_refresh = false;
        self
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    pub fn post_call_count(&self) -> usize {
        *lock(&self.config.post_call_count)
    }

    pub fn refresh_call_count(&self) -> usize {
        *lock(&self.config.refresh_call_count)
    }

    pub fn posted(&self) -> Vec<PostedCall> {
        lock(&self.config.posted).clone()
    }

    /// Highest number of posts that ran at the same time
    pub fn peak_in_flight(&self) -> usize {
        lock(&self.config.in_flight).1
    }
}

#[async_trait]
impl SocialProvider for MockProvider {
    fn identifier(&self) -> &str {
        &self.config.identifier
    }

    fn name(&self) -> &str {
        "Mock"
    }

    fn scopes(&self) -> &[&'static str] {
        &["publish"]
    }

    fn max_concurrent_job(&self) -> usize {
        self.config.max_concurrent
    }

    fn max_length(&self, _additional_settings: &Value) -> usize {
        self.config.max_length
    }

    fn supports_refresh(&self) -> bool {
        self.config.supports_refresh
    }

    fn generate_auth_url(&self) -> Result<GenerateAuthUrlResponse> {
        let state = make_id(STATE_LENGTH);
        Ok(GenerateAuthUrlResponse {
            url: format!("https://mock.example.com/authorize?state={}", state),
            code_verifier: make_id(VERIFIER_LENGTH),
            state,
        })
    }

    async fn authenticate(&self, params: &AuthenticateParams) -> Result<AuthTokenDetails> {
        if params.code.is_empty() {
            return Err(ProviderError::InvalidCredentials("empty code".to_string()).into());
        }
        Ok(AuthTokenDetails {
            id: "mock-user".to_string(),
            name: "Mock User".to_string(),
            access_token: format!("access-{}", params.code),
            refresh_token: Some(format!("refresh-{}", params.code)),
            expires_in: Some(3600),
            picture: None,
            username: "mock".to_string(),
            additional_settings: None,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokenDetails> {
        let count = {
            let mut calls = lock(&self.config.refresh_call_count);
            *calls += 1;
            *calls
        };
        if !self.config.supports_refresh {
            return Err(ProviderError::NotImplemented("mock refresh".to_string()).into());
        }
        if let Some(error) = &self.config.refresh_error {
            return Err(error.clone().into());
        }

        Ok(AuthTokenDetails {
            id: "mock-user".to_string(),
            name: "Mock User".to_string(),
            access_token: format!("refreshed-{}", count),
            refresh_token: Some(refresh_token.to_string()),
            expires_in: Some(3600),
            picture: None,
            username: "mock".to_string(),
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
        *lock(&self.config.post_call_count) += 1;
        {
            let mut in_flight = lock(&self.config.in_flight);
            in_flight.0 += 1;
            in_flight.1 = in_flight.1.max(in_flight.0);
        }

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let scripted = lock(&self.config.post_failures).pop_front();
        let outcome = match scripted.or_else(|| self.config.post_error.clone()) {
            Some(error) => Err(error.into()),
            None => {
                let (live, failure) = match &self.config.fail_after {
                    Some((items, error)) if *items < posts.len() => {
                        (&posts[..*items], Err(error.clone().into()))
                    }
                    _ => (posts, Ok(())),
                };
                lock(&self.config.posted).push(PostedCall {
                    access_token: access_token.to_string(),
                    messages: live.iter().map(|p| p.message.clone()).collect(),
                });
                let responses = live
                    .iter()
                    .map(|post| {
                        let post_id = format!("{}-{}", self.config.identifier, uuid::Uuid::new_v4());
                        let url = format!("https://mock.example.com/{}", post_id);
                        PostResponse::posted(&post.id, post_id, url)
                    })
                    .collect();
                finish_chain(responses, failure)
            }
        };

        lock(&self.config.in_flight).0 -= 1;
        outcome
    }
}
