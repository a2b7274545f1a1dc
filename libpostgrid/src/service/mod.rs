//! Service layer for Postgrid
//!
//! `PostgridService` is the facade the binaries use. It owns the shared
//! resources (database, provider registry, event bus) and hands out the
//! sub-services built on them:
//!
//! - `PublishingService`: provider publishing with limits, retry and refresh
//! - `ShortLinkService`: link shortening for post messages
//! - `SsoServices`: partner products and sign-in
//! - `EventBus`: progress events
//!
//! # Example
//!
//! ```no_run
//! use libpostgrid::service::PostgridService;
//! use libpostgrid::service::publishing::PublishJob;
//! use libpostgrid::types::{Integration, PostDetails};
//!
//! # async fn example(integration: Integration) -> libpostgrid::Result<()> {
//! let service = PostgridService::new().await?;
//!
//! let job = PublishJob::new(integration, vec![PostDetails::new("1", "Hello world")]);
//! let outcome = service.publishing().publish(job).await?;
//! println!("Published {} items", outcome.responses.len());
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod publishing;

use self::events::{EventBus, EventReceiver};
use self::publishing::{PublishPolicy, PublishingService};
use crate::providers::{ProviderHttp, ProviderRegistry, RetryPolicy};
use crate::shortlink::ShortLinkService;
use crate::sso::SsoServices;
use crate::{Config, Database, Result};

pub struct PostgridService {
    db: Database,
    registry: ProviderRegistry,
    publishing: PublishingService,
    short_links: ShortLinkService,
    sso: SsoServices,
    event_bus: EventBus,
}

impl PostgridService {
    /// Create a service from the default configuration file
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Create a service from an already loaded configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a provider cannot be
    /// built, or the database cannot be opened or migrated.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.database.path).await?;
        let event_bus = EventBus::new(100);
        let registry = ProviderRegistry::from_config(&config)?;

        let http = ProviderHttp::new(RetryPolicy::from_config(&config.retry)?);
        let short_links = ShortLinkService::from_config(&config.shortlink, http)?;

        let publishing = PublishingService::new(
            registry.clone(),
            db.clone(),
            event_bus.clone(),
            short_links.clone(),
            PublishPolicy::from_config(&config.publishing)?,
        );
        let sso = SsoServices::from_config(&config, &db, event_bus.clone())?;

        Ok(Self {
            db,
            registry,
            publishing,
            short_links,
            sso,
            event_bus,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn publishing(&self) -> &PublishingService {
        &self.publishing
    }

    pub fn short_links(&self) -> &ShortLinkService {
        &self.short_links
    }

    pub fn sso(&self) -> &SsoServices {
        &self.sso
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }
}
