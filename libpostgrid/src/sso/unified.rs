//! Single entry point for partner sign-in
//!
//! A product signs `"{timestamp}.{external_id}.{email}"` with its signing
//! secret (HMAC-SHA256, hex) and posts the result along with its API key.
//! The caller gets either a session token or, when a redirect URI is given,
//! a redirect carrying a single-use login code.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::mapping::UserMappingService;
use super::models::{ExternalIdentity, SessionToken};
use super::platform::PlatformService;
use super::seamless::SeamlessAuthService;
use super::token::{hmac_hex, verify_hmac_hex};
use crate::error::{Result, SsoError};
use crate::service::events::{Event, EventBus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoRequest {
    pub api_key: String,
    pub external_id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Unix seconds at signing time
    pub timestamp: i64,
    /// Hex HMAC-SHA256 of the signing payload
    pub signature: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SsoResponse {
    #[serde(rename_all = "camelCase")]
    Session {
        token: String,
        expires_at: i64,
        user_id: String,
        organization_id: String,
        created: bool,
    },
    Redirect { url: String },
}

fn signing_payload(timestamp: i64, external_id: &str, email: &str) -> String {
    format!("{}.{}.{}", timestamp, external_id, email)
}

/// Signature a product sends with an [`SsoRequest`]
pub fn sign_request(signing_secret: &str, timestamp: i64, external_id: &str, email: &str) -> Result<String> {
    hmac_hex(signing_secret, &signing_payload(timestamp, external_id, email))
}

#[derive(Clone)]
pub struct UnifiedSsoService {
    platform: PlatformService,
    mapping: UserMappingService,
    seamless: SeamlessAuthService,
    events: EventBus,
    /// Accepted clock skew between the product and us
    tolerance: Duration,
}

impl UnifiedSsoService {
    pub fn new(
        platform: PlatformService,
        mapping: UserMappingService,
        seamless: SeamlessAuthService,
        events: EventBus,
        tolerance: Duration,
    ) -> Self {
        Self {
            platform,
            mapping,
            seamless,
            events,
            tolerance,
        }
    }

    pub async fn authenticate(&self, request: SsoRequest) -> Result<SsoResponse> {
        let product = self
            .platform
            .find_by_api_key(&request.api_key)
            .await?
            .ok_or_else(|| SsoError::ProductNotFound("unknown API key".to_string()))?;
        if !product.active {
            return Err(SsoError::ProductInactive(product.slug).into());
        }

        let skew_secs = chrono::Utc::now().timestamp().saturating_sub(request.timestamp);
        if skew_secs.unsigned_abs() > self.tolerance.as_secs() {
            warn!(product = %product.slug, skew_secs, "Rejected SSO request outside the time window");
            return Err(SsoError::ExpiredRequest { skew_secs }.into());
        }

        let payload = signing_payload(request.timestamp, &request.external_id, &request.email);
        if verify_hmac_hex(&product.signing_secret, &payload, &request.signature).is_err() {
            warn!(product = %product.slug, "Rejected SSO request with a bad signature");
            return Err(SsoError::InvalidSignature.into());
        }

        if let Some(uri) = &request.redirect_uri {
            if !product.allows_redirect(uri) {
                return Err(SsoError::InvalidRedirect(uri.clone()).into());
            }
        }

        let mapped = self
            .mapping
            .map_user(
                &product,
                &ExternalIdentity {
                    external_id: request.external_id,
                    email: request.email,
                    name: request.name,
                },
            )
            .await?;

        info!(product = %product.slug, user_id = %mapped.user.id, created = mapped.created, "SSO login");
        self.events.emit(Event::SsoLogin {
            product_id: product.id.clone(),
            user_id: mapped.user.id.clone(),
        });

        match request.redirect_uri {
            Some(uri) => {
                let code = self.seamless.create_login_code(mapped.subject());
                let url = self.seamless.build_redirect(&product, &uri, &code)?;
                Ok(SsoResponse::Redirect { url })
            }
            None => {
                let session = self.seamless.issue_session(&mapped.subject())?;
                Ok(SsoResponse::Session {
                    token: session.token,
                    expires_at: session.expires_at,
                    user_id: mapped.user.id,
                    organization_id: mapped.organization.id,
                    created: mapped.created,
                })
            }
        }
    }

    /// Trade a login code from a redirect for a session token
    pub fn exchange_code(&self, code: &str) -> Result<SessionToken> {
        self.seamless.redeem_login_code(code)
    }

    pub fn sign_request(&self, signing_secret: &str, timestamp: i64, external_id: &str, email: &str) -> Result<String> {
        sign_request(signing_secret, timestamp, external_id, email)
    }
}
