//! Partner product registration and credentials

use regex::Regex;
use reqwest::Url;
use std::sync::{Arc, OnceLock};
use tracing::info;

use super::models::{AuditEntry, NewProduct, Product, ProductCredentials, ProductHealth, ProductUpdate};
use super::store::SsoStore;
use super::token::sha256_hex;
use crate::cache::TtlCache;
use crate::error::{PostgridError, Result, SsoError};
use crate::providers::http::make_id;
use crate::service::events::{Event, EventBus};

const API_KEY_PREFIX: &str = "pgk_";
const SECRET_PREFIX: &str = "pgs_";

fn slug_regex() -> &'static Regex {
    static SLUG: OnceLock<Regex> = OnceLock::new();
    SLUG.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{1,62}[a-z0-9]$").expect("Valid regex"))
}

fn invalid(message: impl Into<String>) -> PostgridError {
    PostgridError::InvalidInput(message.into())
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).map_err(|e| invalid(format!("{} '{}': {}", field, value, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid(format!("{} '{}' must be an http(s) URL", field, value)));
    }
    Ok(())
}

fn validate_redirects(uris: &[String]) -> Result<()> {
    for uri in uris {
        validate_url("redirect URI", uri)?;
    }
    Ok(())
}

fn new_credentials() -> (String, String) {
    (
        format!("{}{}", API_KEY_PREFIX, make_id(40)),
        format!("{}{}", SECRET_PREFIX, make_id(48)),
    )
}

/// Registers partner products and resolves them from API keys
#[derive(Clone)]
pub struct PlatformService {
    store: SsoStore,
    events: EventBus,
    /// API key hash -> product
    by_key: Arc<TtlCache<String, Product>>,
}

impl PlatformService {
    pub fn new(store: SsoStore, events: EventBus, cache: Arc<TtlCache<String, Product>>) -> Self {
        Self {
            store,
            events,
            by_key: cache,
        }
    }

    async fn audit(&self, product_id: &str, action: &str, detail: &str) -> Result<()> {
        self.store
            .insert_audit(Some(product_id), action, detail, chrono::Utc::now().timestamp())
            .await
    }

    async fn require(&self, id: &str) -> Result<Product> {
        self.store
            .product_by_id(id)
            .await?
            .ok_or_else(|| SsoError::ProductNotFound(id.to_string()).into())
    }

    /// Register a product
    ///
    /// The returned API key and signing secret are shown once; only a hash
    /// of the API key is stored.
    pub async fn register_product(&self, new: NewProduct) -> Result<ProductCredentials> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(invalid("Product name must not be empty"));
        }
        if !slug_regex().is_match(&new.slug) {
            return Err(invalid(format!(
                "Slug '{}' must be 3-64 lowercase letters, digits or dashes",
                new.slug
            )));
        }
        validate_redirects(&new.redirect_uris)?;
        if let Some(health_url) = &new.health_url {
            validate_url("health URL", health_url)?;
        }
        if self.store.product_by_slug(&new.slug).await?.is_some() {
            return Err(SsoError::DuplicateSlug(new.slug).into());
        }

        let (api_key, signing_secret) = new_credentials();
        let now = chrono::Utc::now().timestamp();
        let product = Product {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            slug: new.slug,
            signing_secret: signing_secret.clone(),
            redirect_uris: new.redirect_uris,
            health_url: new.health_url,
            active: true,
            created_at: now,
            updated_at: now,
        };

        self.store
            .insert_product(&product, &sha256_hex(&api_key))
            .await?;
        self.audit(&product.id, "registered", &product.slug).await?;

        info!(product_id = %product.id, slug = %product.slug, "Registered product");
        self.events.emit(Event::ProductRegistered {
            product_id: product.id.clone(),
            slug: product.slug.clone(),
        });

        Ok(ProductCredentials {
            product,
            api_key,
            signing_secret,
        })
    }

    pub async fn update_product(&self, id: &str, update: ProductUpdate) -> Result<Product> {
        let mut product = self.require(id).await?;

        if let Some(name) = update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid("Product name must not be empty"));
            }
            product.name = name.to_string();
        }
        if let Some(uris) = update.redirect_uris {
            validate_redirects(&uris)?;
            product.redirect_uris = uris;
        }
        if let Some(health_url) = update.health_url {
            if health_url.is_empty() {
                product.health_url = None;
            } else {
                validate_url("health URL", &health_url)?;
                product.health_url = Some(health_url);
            }
        }
        product.updated_at = chrono::Utc::now().timestamp();

        self.store.update_product(&product).await?;
        self.by_key.clear();
        self.audit(&product.id, "updated", "").await?;
        self.events.emit(Event::ProductUpdated {
            product_id: product.id.clone(),
            change: "updated".to_string(),
        });

        Ok(product)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Product>> {
        self.store.product_by_id(id).await
    }

    pub async fn find_by_slug(&self, slug: &str) -> Result<Option<Product>> {
        self.store.product_by_slug(slug).await
    }

    /// Resolve a product from its plaintext API key; hits are cached
    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Product>> {
        let hash = sha256_hex(api_key);
        if let Some(product) = self.by_key.get(&hash) {
            return Ok(Some(product));
        }

        let product = self.store.product_by_api_key_hash(&hash).await?;
        if let Some(product) = &product {
            self.by_key.insert(hash, product.clone());
        }
        Ok(product)
    }

    /// Issue a new API key and signing secret, invalidating the old pair
    pub async fn rotate_credentials(&self, id: &str) -> Result<ProductCredentials> {
        let mut product = self.require(id).await?;
        let (api_key, signing_secret) = new_credentials();
        product.signing_secret = signing_secret.clone();
        product.updated_at = chrono::Utc::now().timestamp();

        self.store
            .set_credentials(&product.id, &sha256_hex(&api_key), &signing_secret, product.updated_at)
            .await?;
        self.by_key.clear();
        self.audit(&product.id, "credentials_rotated", "").await?;

        info!(product_id = %product.id, "Rotated product credentials");
        self.events.emit(Event::ProductUpdated {
            product_id: product.id.clone(),
            change: "credentials_rotated".to_string(),
        });

        Ok(ProductCredentials {
            product,
            api_key,
            signing_secret,
        })
    }

    pub async fn deactivate(&self, id: &str) -> Result<Product> {
        let mut product = self.require(id).await?;
        if !product.active {
            return Ok(product);
        }
        product.active = false;
        product.updated_at = chrono::Utc::now().timestamp();

        self.store.update_product(&product).await?;
        self.by_key.clear();
        self.audit(&product.id, "deactivated", "").await?;

        info!(product_id = %product.id, "Deactivated product");
        self.events.emit(Event::ProductUpdated {
            product_id: product.id.clone(),
            change: "deactivated".to_string(),
        });

        Ok(product)
    }

    pub async fn list_active(&self) -> Result<Vec<Product>> {
        self.store.list_products(false).await
    }

    pub async fn list_all(&self) -> Result<Vec<Product>> {
        self.store.list_products(true).await
    }

    pub async fn record_health(&self, health: &ProductHealth) -> Result<()> {
        self.store.insert_health(health).await
    }

    pub async fn latest_health(&self, product_id: &str) -> Result<Option<ProductHealth>> {
        self.store.latest_health(product_id).await
    }

    pub async fn audit_log(&self, product_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        self.store.audit_for_product(product_id, limit).await
    }
}
