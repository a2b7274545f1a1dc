//! Postgrid - social media publishing and partner sign-in
//!
//! This library provides the provider adapters that publish to social
//! networks, the publishing service that drives them, and the SSO services
//! that let partner products sign their users in.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod providers;
pub mod service;
pub mod shortlink;
pub mod sso;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{PostgridError, Result};
pub use providers::{ProviderRegistry, SocialProvider};
pub use service::PostgridService;
pub use types::{AuthTokenDetails, Integration, PostDetails, PostResponse, PublishRecord, PublishStatus};
