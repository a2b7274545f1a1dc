//! Maps product user ids onto internal users and organizations

use tracing::debug;

use super::models::{ExternalIdentity, MappedUser, Organization, Product, User, UserMapping};
use super::store::SsoStore;
use crate::error::{DbError, Result, SsoError};
use crate::service::events::{Event, EventBus};

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(SsoError::InvalidIdentity(format!("invalid email '{}'", email)).into()),
    }
}

#[derive(Clone)]
pub struct UserMappingService {
    store: SsoStore,
    events: EventBus,
}

impl UserMappingService {
    pub fn new(store: SsoStore, events: EventBus) -> Self {
        Self { store, events }
    }

    async fn resolve(&self, mapping: UserMapping, created: bool) -> Result<MappedUser> {
        let corrupt = |what: &str| DbError::CorruptRow {
            table: "user_mappings".to_string(),
            message: format!("mapping {} points at a missing {}", mapping.id, what),
        };
        let user = self
            .store
            .user_by_id(&mapping.user_id)
            .await?
            .ok_or_else(|| corrupt("user"))?;
        let organization = self
            .store
            .organization_by_id(&mapping.organization_id)
            .await?
            .ok_or_else(|| corrupt("organization"))?;

        Ok(MappedUser {
            user,
            organization,
            mapping,
            created,
        })
    }

    /// Find or create the internal user for `identity`
    ///
    /// Users are matched by lowercased email across products. A new user gets
    /// a personal organization. Mapping an already mapped identity only
    /// updates its last login time.
    pub async fn map_user(&self, product: &Product, identity: &ExternalIdentity) -> Result<MappedUser> {
        let external_id = identity.external_id.trim();
        if external_id.is_empty() {
            return Err(SsoError::InvalidIdentity("external id must not be empty".to_string()).into());
        }
        let email = normalize_email(&identity.email)?;
        let now = chrono::Utc::now().timestamp();

        if let Some(mut mapping) = self.store.mapping(&product.id, external_id).await? {
            self.store.touch_mapping(&mapping.id, now).await?;
            mapping.last_login_at = now;
            debug!(product_id = %product.id, user_id = %mapping.user_id, "Existing mapping");
            return self.resolve(mapping, false).await;
        }

        let candidate = User {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.clone(),
            name: identity
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string()),
            created_at: now,
        };
        let user = self.store.insert_user_if_absent(&candidate).await?;
        let created = user.id == candidate.id;

        let organization = match self.store.personal_organization(&user.id).await? {
            Some(organization) => organization,
            None => {
                let organization = Organization {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: format!("{}'s workspace", user.name),
                    owner_user_id: user.id.clone(),
                    created_at: now,
                };
                self.store.insert_organization(&organization).await?;
                organization
            }
        };

        let mapping = self
            .store
            .insert_mapping_if_absent(&UserMapping {
                id: uuid::Uuid::new_v4().to_string(),
                product_id: product.id.clone(),
                external_id: external_id.to_string(),
                user_id: user.id.clone(),
                organization_id: organization.id.clone(),
                email,
                created_at: now,
                last_login_at: now,
            })
            .await?;

        self.events.emit(Event::UserMapped {
            product_id: product.id.clone(),
            user_id: mapping.user_id.clone(),
            created,
        });

        self.resolve(mapping, created).await
    }

    pub async fn find_mapping(&self, product_id: &str, external_id: &str) -> Result<Option<UserMapping>> {
        self.store.mapping(product_id, external_id).await
    }

    pub async fn mappings_for_user(&self, user_id: &str) -> Result<Vec<UserMapping>> {
        self.store.mappings_for_user(user_id).await
    }

    /// Remove a mapping; the internal user is kept
    pub async fn unlink(&self, product_id: &str, external_id: &str) -> Result<bool> {
        self.store.delete_mapping(product_id, external_id).await
    }

    pub async fn count_for_product(&self, product_id: &str) -> Result<i64> {
        self.store.count_mappings(product_id).await
    }

    /// Mapped users of `product_id` who signed in at or after `since` (unix seconds)
    pub async fn logins_since(&self, product_id: &str, since: i64) -> Result<i64> {
        self.store.count_logins_since(product_id, since).await
    }
}
