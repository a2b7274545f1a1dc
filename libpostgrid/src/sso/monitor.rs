//! Periodic health checks and usage analytics for active products

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::mapping::UserMappingService;
use super::models::{Product, ProductAnalytics, ProductHealth};
use super::platform::PlatformService;
use crate::cache::TtlCache;
use crate::error::Result;
use crate::service::events::{Event, EventBus};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
const DAY_SECS: i64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct ProductMonitor {
    platform: PlatformService,
    mapping: UserMappingService,
    client: reqwest::Client,
    events: EventBus,
    health_interval: Duration,
    analytics_interval: Duration,
    analytics: Arc<TtlCache<String, ProductAnalytics>>,
}

impl ProductMonitor {
    pub fn new(
        platform: PlatformService,
        mapping: UserMappingService,
        events: EventBus,
        analytics: Arc<TtlCache<String, ProductAnalytics>>,
    ) -> Self {
        Self {
            platform,
            mapping,
            client: reqwest::Client::new(),
            events,
            health_interval: Duration::from_secs(5 * 60),
            analytics_interval: Duration::from_secs(60 * 60),
            analytics,
        }
    }

    pub fn with_intervals(mut self, health: Duration, analytics: Duration) -> Self {
        self.health_interval = health;
        self.analytics_interval = analytics;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn check(&self, product: &Product, url: &str) -> Result<ProductHealth> {
        let previous = self.platform.latest_health(&product.id).await?;

        let started = Instant::now();
        let response = self.client.get(url).timeout(HEALTH_TIMEOUT).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let health = match response {
            Ok(response) => ProductHealth {
                product_id: product.id.clone(),
                healthy: response.status().is_success(),
                status_code: Some(response.status().as_u16()),
                latency_ms,
                error: None,
                checked_at: chrono::Utc::now().timestamp(),
            },
            Err(e) => ProductHealth {
                product_id: product.id.clone(),
                healthy: false,
                status_code: None,
                latency_ms,
                error: Some(e.to_string()),
                checked_at: chrono::Utc::now().timestamp(),
            },
        };
        self.platform.record_health(&health).await?;

        let changed = match previous {
            Some(previous) => previous.healthy != health.healthy,
            None => !health.healthy,
        };
        if changed {
            if health.healthy {
                info!(product = %product.slug, "Product is healthy again");
            } else {
                warn!(product = %product.slug, status = ?health.status_code, "Product health check failed");
            }
            self.events.emit(Event::ProductHealthChanged {
                product_id: product.id.clone(),
                healthy: health.healthy,
            });
        }

        Ok(health)
    }

    /// Check the health URL of every active product once
    ///
    /// Products without a health URL are skipped. A failing check is recorded
    /// as unhealthy, not returned as an error.
    pub async fn check_health_once(&self) -> Result<Vec<ProductHealth>> {
        let products = self.platform.list_active().await?;
        let checks = products.iter().filter_map(|product| {
            product
                .health_url
                .as_deref()
                .map(|url| self.check(product, url))
        });

        join_all(checks).await.into_iter().collect()
    }

    /// Recompute mapped-user and last-day login counts for every active product
    pub async fn refresh_analytics_once(&self) -> Result<Vec<ProductAnalytics>> {
        let now = chrono::Utc::now().timestamp();
        let mut results = Vec::new();

        for product in self.platform.list_active().await? {
            let analytics = ProductAnalytics {
                product_id: product.id.clone(),
                mapped_users: self.mapping.count_for_product(&product.id).await?,
                logins_last_day: self.mapping.logins_since(&product.id, now - DAY_SECS).await?,
                computed_at: now,
            };
            debug!(product = %product.slug, users = analytics.mapped_users, logins = analytics.logins_last_day, "Refreshed analytics");
            self.analytics.insert(product.id, analytics.clone());
            results.push(analytics);
        }

        Ok(results)
    }

    /// Last computed analytics for a product, while still cached
    pub fn analytics(&self, product_id: &str) -> Option<ProductAnalytics> {
        self.analytics.get(&product_id.to_string())
    }

    /// Run both checks on their intervals until `shutdown` is set
    ///
    /// Both run immediately on start. Failures are logged and the loop keeps
    /// going.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let mut health = interval(self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut analytics = interval(self.analytics_interval);
        analytics.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Monitoring products (health every {:?}, analytics every {:?})",
            self.health_interval, self.analytics_interval
        );

        while !shutdown.load(Ordering::Relaxed) {
            tokio::select! {
                _ = health.tick() => {
                    if let Err(e) = self.check_health_once().await {
                        error!("Health check failed: {}", e);
                    }
                }
                _ = analytics.tick() => {
                    if let Err(e) = self.refresh_analytics_once().await {
                        error!("Analytics refresh failed: {}", e);
                    }
                }
                // Wake up regularly to notice shutdown
                _ = sleep(Duration::from_secs(1)) => {}
            }
        }

        info!("Product monitor stopped");
        Ok(())
    }
}
