//! Publishing service
//!
//! Hands post chains to providers while enforcing each provider's declared
//! concurrency limit, retrying transient failures with exponential backoff,
//! refreshing a rejected token once, and recording every outcome.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};

use super::events::{Event, EventBus};
use crate::config::{parse_duration, PublishingConfig};
use crate::db::Database;
use crate::error::{PostgridError, ProviderError, Result};
use crate::providers::{ProviderRegistry, SocialProvider};
use crate::shortlink::ShortLinkService;
use crate::types::{
    AuthTokenDetails, Integration, PostDetails, PostResponse, PublishRecord, PublishStatus,
};

/// Retry bounds for whole `post` calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry
    pub base_delay: Duration,
}

impl PublishPolicy {
    pub fn from_config(config: &PublishingConfig) -> Result<Self> {
        Ok(Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: parse_duration("publishing.base_delay", &config.base_delay)?,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2_u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// One chain of posts for one integration
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub job_id: String,
    pub integration: Integration,
    pub posts: Vec<PostDetails>,
    /// Rewrite links through the configured shortener first
    pub shorten_links: bool,
}

impl PublishJob {
    pub fn new(integration: Integration, posts: Vec<PostDetails>) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            integration,
            posts,
            shorten_links: false,
        }
    }

    pub fn with_short_links(mut self) -> Self {
        self.shorten_links = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    pub job_id: String,
    pub provider: String,
    pub integration_id: String,
    pub responses: Vec<PostResponse>,
    /// Number of `post` calls made
    pub attempts: u32,
    /// New token details when the token was refreshed; the caller persists them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreshed_token: Option<AuthTokenDetails>,
}

#[derive(Clone)]
pub struct PublishingService {
    registry: ProviderRegistry,
    db: Database,
    events: EventBus,
    short_links: ShortLinkService,
    policy: PublishPolicy,
    semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl PublishingService {
    pub fn new(
        registry: ProviderRegistry,
        db: Database,
        events: EventBus,
        short_links: ShortLinkService,
        policy: PublishPolicy,
    ) -> Self {
        Self {
            registry,
            db,
            events,
            short_links,
            policy,
            semaphores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// One semaphore per provider, sized by its declared limit
    fn semaphore_for(&self, provider: &dyn SocialProvider) -> Arc<Semaphore> {
        let mut semaphores = self
            .semaphores
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        semaphores
            .entry(provider.identifier().to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(provider.max_concurrent_job().max(1))))
            .clone()
    }

    fn validate(provider: &dyn SocialProvider, job: &PublishJob) -> Result<()> {
        if job.posts.is_empty() {
            return Err(PostgridError::InvalidInput("Nothing to publish".to_string()));
        }
        let limit = provider.max_length(&job.integration.additional_settings);
        for post in &job.posts {
            let length = post.message.chars().count();
            if length > limit {
                return Err(ProviderError::Validation(format!(
                    "Post {} is {} characters, {} allows {}",
                    post.id,
                    length,
                    provider.name(),
                    limit
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Publish one job
    ///
    /// Waits for a free slot under the provider's concurrency limit.
    /// Transient failures (`Network`, `RateLimit`) are retried up to
    /// `max_attempts` times. A `RefreshToken` failure triggers one token
    /// refresh followed by a retry with the new token. A chain that fails
    /// after some items went live is never retried; those items are recorded
    /// as published and the rest as failed.
    pub async fn publish(&self, job: PublishJob) -> Result<PublishOutcome> {
        let provider = self.registry.require(&job.integration.provider_identifier)?;
        let identifier = provider.identifier().to_string();

        let mut posts = job.posts.clone();
        if job.shorten_links {
            let messages: Vec<String> = posts.iter().map(|p| p.message.clone()).collect();
            if self.short_links.ask_short_link(&messages) {
                let converted = self
                    .short_links
                    .convert_text_to_short_links(&job.integration.id, &messages)
                    .await?;
                for (post, message) in posts.iter_mut().zip(converted) {
                    post.message = message;
                }
            }
        }
        let job = PublishJob { posts, ..job };
        Self::validate(provider.as_ref(), &job)?;

        let semaphore = self.semaphore_for(provider.as_ref());
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| ProviderError::Posting(format!("Publishing slot unavailable: {}", e)))?;

        self.events.emit(Event::PublishStarted {
            job_id: job.job_id.clone(),
            provider: identifier.clone(),
            integration_id: job.integration.id.clone(),
        });

        let mut token = job.integration.token.clone();
        let mut refreshed_token = None;
        let mut attempts = 0;
        let mut transient_attempts = 0;

        let failure = loop {
            attempts += 1;
            transient_attempts += 1;
            let error = match provider
                .post(&job.integration.internal_id, &token, &job.posts, &job.integration)
                .await
            {
                Ok(responses) => {
                    return self
                        .complete(&job, &identifier, responses, attempts, refreshed_token)
                        .await;
                }
                Err(error) => error,
            };

            let Some(provider_error) = error.as_provider() else {
                break error;
            };

            if matches!(provider_error, ProviderError::RefreshToken { .. })
                && refreshed_token.is_none()
                && provider.supports_refresh()
            {
                match self.refresh(provider.as_ref(), &job.integration).await {
                    Some(details) => {
                        token = details.access_token.clone();
                        refreshed_token = Some(details);
                        transient_attempts = 0;
                        continue;
                    }
                    None => break error,
                }
            }

            if provider_error.is_transient() && transient_attempts < self.policy.max_attempts {
                let delay = self.policy.backoff(transient_attempts);
                warn!(
                    provider = %identifier,
                    job_id = %job.job_id,
                    "Transient error (attempt {}/{}): {}. Retrying in {:?}",
                    transient_attempts,
                    self.policy.max_attempts,
                    error,
                    delay
                );
                sleep(delay).await;
                continue;
            }

            break error;
        };

        self.fail(&job, &identifier, failure, attempts).await
    }

    /// Publish several jobs concurrently
    ///
    /// Results are returned in input order. Per-provider limits still apply.
    pub async fn publish_all(&self, jobs: Vec<PublishJob>) -> Vec<Result<PublishOutcome>> {
        join_all(jobs.into_iter().map(|job| self.publish(job))).await
    }

    async fn refresh(
        &self,
        provider: &dyn SocialProvider,
        integration: &Integration,
    ) -> Option<AuthTokenDetails> {
        let refresh_token = integration
            .refresh_token
            .clone()
            .unwrap_or_else(|| integration.token.clone());

        match provider.refresh_token(&refresh_token).await {
            Ok(details) if !details.access_token.is_empty() => {
                info!(provider = provider.identifier(), integration_id = %integration.id, "Refreshed access token");
                self.events.emit(Event::TokenRefreshed {
                    provider: provider.identifier().to_string(),
                    integration_id: integration.id.clone(),
                });
                Some(details)
            }
            Ok(_) => {
                warn!(provider = provider.identifier(), "Token refresh returned an empty token");
                None
            }
            Err(e) => {
                warn!(provider = provider.identifier(), "Token refresh failed: {}", e);
                None
            }
        }
    }

    async fn complete(
        &self,
        job: &PublishJob,
        identifier: &str,
        responses: Vec<PostResponse>,
        attempts: u32,
        refreshed_token: Option<AuthTokenDetails>,
    ) -> Result<PublishOutcome> {
        let now = chrono::Utc::now().timestamp();
        for response in &responses {
            self.db
                .create_publish_record(&PublishRecord {
                    id: None,
                    job_id: job.job_id.clone(),
                    integration_id: job.integration.id.clone(),
                    provider: identifier.to_string(),
                    post_id: response.id.clone(),
                    network_post_id: Some(response.post_id.clone()),
                    release_url: Some(response.release_url.clone()),
                    status: PublishStatus::Published,
                    error_message: None,
                    attempts,
                    published_at: now,
                })
                .await?;
        }

        info!(provider = identifier, job_id = %job.job_id, items = responses.len(), attempts, "Published");
        self.events.emit(Event::PublishCompleted {
            job_id: job.job_id.clone(),
            provider: identifier.to_string(),
            post_ids: responses.iter().map(|r| r.post_id.clone()).collect(),
            attempts,
        });

        Ok(PublishOutcome {
            job_id: job.job_id.clone(),
            provider: identifier.to_string(),
            integration_id: job.integration.id.clone(),
            responses,
            attempts,
            refreshed_token,
        })
    }

    async fn fail(
        &self,
        job: &PublishJob,
        identifier: &str,
        error: PostgridError,
        attempts: u32,
    ) -> Result<PublishOutcome> {
        let now = chrono::Utc::now().timestamp();
        let message = error.to_string();
        let published = error.as_provider().map(|e| e.published()).unwrap_or_default();
        for post in &job.posts {
            let live = published.iter().find(|r| r.id == post.id);
            self.db
                .create_publish_record(&PublishRecord {
                    id: None,
                    job_id: job.job_id.clone(),
                    integration_id: job.integration.id.clone(),
                    provider: identifier.to_string(),
                    post_id: post.id.clone(),
                    network_post_id: live.map(|r| r.post_id.clone()),
                    release_url: live.map(|r| r.release_url.clone()),
                    status: if live.is_some() {
                        PublishStatus::Published
                    } else {
                        PublishStatus::Failed
                    },
                    error_message: if live.is_some() { None } else { Some(message.clone()) },
                    attempts,
                    published_at: now,
                })
                .await?;
        }

        let reauthenticate = error
            .as_provider()
            .is_some_and(|e| e.requires_reauthentication());
        if reauthenticate {
            self.events.emit(Event::RefreshRequired {
                provider: identifier.to_string(),
                integration_id: job.integration.id.clone(),
            });
        }

        warn!(provider = identifier, job_id = %job.job_id, attempts, "Publishing failed: {}", message);
        self.events.emit(Event::PublishFailed {
            job_id: job.job_id.clone(),
            provider: identifier.to_string(),
            error: message,
            reauthenticate,
        });

        Err(error)
    }
}
