//! Data model for partner products and the users they sign in

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// A partner product allowed to sign its users into Postgrid
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub slug: String,
    /// HMAC key shared with the product; never serialized
    #[serde(skip_serializing, default)]
    pub signing_secret: String,
    pub redirect_uris: Vec<String>,
    pub health_url: Option<String>,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Product {
    /// Whether `uri` matches one of the registered redirect URIs
    ///
    /// Scheme, host, port and path must match exactly; the query string is
    /// ignored.
    pub fn allows_redirect(&self, uri: &str) -> bool {
        let Ok(candidate) = Url::parse(uri) else {
            return false;
        };
        self.redirect_uris
            .iter()
            .filter_map(|allowed| Url::parse(allowed).ok())
            .any(|allowed| {
                allowed.scheme() == candidate.scheme()
                    && allowed.host_str() == candidate.host_str()
                    && allowed.port_or_known_default() == candidate.port_or_known_default()
                    && allowed.path() == candidate.path()
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub health_url: Option<String>,
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
    pub health_url: Option<String>,
}

/// Returned once on registration and rotation; only a hash of the key is kept
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCredentials {
    pub product: Product,
    pub api_key: String,
    pub signing_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub owner_user_id: String,
    pub created_at: i64,
}

/// Link between a product's user id and an internal user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserMapping {
    pub id: String,
    pub product_id: String,
    pub external_id: String,
    pub user_id: String,
    pub organization_id: String,
    pub email: String,
    pub created_at: i64,
    pub last_login_at: i64,
}

/// A user as asserted by a partner product
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIdentity {
    pub external_id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MappedUser {
    pub user: User,
    pub organization: Organization,
    pub mapping: UserMapping,
    /// The internal user was created by this call
    pub created: bool,
}

impl MappedUser {
    pub fn subject(&self) -> SessionSubject {
        SessionSubject {
            user_id: self.user.id.clone(),
            organization_id: self.organization.id.clone(),
            product_id: self.mapping.product_id.clone(),
            email: self.user.email.clone(),
        }
    }
}

/// Who a session or login code is issued for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSubject {
    pub user_id: String,
    pub organization_id: String,
    pub product_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductHealth {
    pub product_id: String,
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub checked_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductAnalytics {
    pub product_id: String,
    pub mapped_users: i64,
    pub logins_last_day: i64,
    pub computed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub product_id: Option<String>,
    pub action: String,
    pub detail: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(redirects: &[&str]) -> Product {
        Product {
            id: "p1".to_string(),
            name: "Partner".to_string(),
            slug: "partner".to_string(),
            signing_secret: "secret".to_string(),
            redirect_uris: redirects.iter().map(|s| s.to_string()).collect(),
            health_url: None,
            active: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_allows_redirect() {
        let product = product(&["https://partner.example.com/sso/callback"]);
        assert!(product.allows_redirect("https://partner.example.com/sso/callback"));
        assert!(product.allows_redirect("https://partner.example.com:443/sso/callback?next=/home"));
        assert!(!product.allows_redirect("http://partner.example.com/sso/callback"));
        assert!(!product.allows_redirect("https://evil.example.com/sso/callback"));
        assert!(!product.allows_redirect("https://partner.example.com/sso/callback/extra"));
        assert!(!product.allows_redirect("not a url"));
    }

    #[test]
    fn test_signing_secret_not_serialized() {
        let json = serde_json::to_value(product(&[])).unwrap();
        assert!(json.get("signingSecret").is_none());
        assert_eq!(json["slug"], "partner");
    }
}
