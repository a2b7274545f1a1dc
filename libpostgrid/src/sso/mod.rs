//! Single sign-on for partner products
//!
//! Products register once and receive an API key plus a signing secret.
//! Their users then sign in through [`UnifiedSsoService::authenticate`],
//! which maps each external identity onto an internal user and organization.
//!
//! - `PlatformService`: product registration, credentials, health records
//! - `UserMappingService`: external identity to internal user
//! - `SeamlessAuthService`: session tokens and single-use login codes
//! - `UnifiedSsoService`: signed sign-in requests
//! - `ProductMonitor`: periodic health checks and analytics

pub mod mapping;
pub mod models;
pub mod monitor;
pub mod platform;
pub mod seamless;
pub mod store;
pub mod token;
pub mod unified;

pub use mapping::UserMappingService;
pub use monitor::ProductMonitor;
pub use platform::PlatformService;
pub use seamless::SeamlessAuthService;
pub use unified::{sign_request, SsoRequest, SsoResponse, UnifiedSsoService};

use secrecy::SecretString;
use std::sync::Arc;
use tracing::warn;

use self::store::SsoStore;
use crate::cache::TtlCache;
use crate::config::{parse_duration, Config};
use crate::db::Database;
use crate::error::Result;
use crate::providers::http::make_id;
use crate::service::events::EventBus;

/// The SSO services wired to one database and event bus
#[derive(Clone)]
pub struct SsoServices {
    pub platform: PlatformService,
    pub mapping: UserMappingService,
    pub seamless: SeamlessAuthService,
    pub unified: UnifiedSsoService,
    pub monitor: ProductMonitor,
}

impl SsoServices {
    pub fn from_config(config: &Config, db: &Database, events: EventBus) -> Result<Self> {
        let sso = &config.sso;
        let cache_ttl = parse_duration("sso.cache_ttl", &sso.cache_ttl)?;
        let store = SsoStore::new(db);

        let platform = PlatformService::new(
            store.clone(),
            events.clone(),
            Arc::new(TtlCache::with_system_clock(cache_ttl, sso.cache_capacity)),
        );
        let mapping = UserMappingService::new(store, events.clone());

        let secret = if config.server.jwt_secret.is_empty() {
            warn!("server.jwt_secret is not set; sessions will not survive a restart");
            make_id(64)
        } else {
            config.server.jwt_secret.clone()
        };
        let seamless = SeamlessAuthService::new(
            SecretString::from(secret),
            parse_duration("sso.session_ttl", &sso.session_ttl)?,
            Arc::new(TtlCache::with_system_clock(
                parse_duration("sso.login_code_ttl", &sso.login_code_ttl)?,
                sso.cache_capacity,
            )),
        );

        let unified = UnifiedSsoService::new(
            platform.clone(),
            mapping.clone(),
            seamless.clone(),
            events.clone(),
            parse_duration("sso.signature_tolerance", &sso.signature_tolerance)?,
        );

        let analytics_interval = parse_duration("sso.analytics_interval", &sso.analytics_interval)?;
        let monitor = ProductMonitor::new(
            platform.clone(),
            mapping.clone(),
            events,
            Arc::new(TtlCache::with_system_clock(analytics_interval * 2, sso.cache_capacity)),
        )
        .with_intervals(
            parse_duration("sso.health_interval", &sso.health_interval)?,
            analytics_interval,
        );

        Ok(Self {
            platform,
            mapping,
            seamless,
            unified,
            monitor,
        })
    }
}
