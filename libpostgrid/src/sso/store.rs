//! SQLite queries for the SSO tables

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::models::{AuditEntry, Organization, Product, ProductHealth, User, UserMapping};
use crate::db::Database;
use crate::error::{DbError, PostgridError, Result, SsoError};

const PRODUCT_COLUMNS: &str = "id, name, slug, signing_secret, redirect_uris, health_url, active, created_at, updated_at";
const MAPPING_COLUMNS: &str =
    "id, product_id, external_id, user_id, organization_id, email, created_at, last_login_at";

#[derive(Clone)]
pub struct SsoStore {
    pool: SqlitePool,
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(e) if e.is_unique_violation())
}

impl SsoStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn insert_product(&self, product: &Product, api_key_hash: &str) -> Result<()> {
        let redirect_uris = serde_json::to_string(&product.redirect_uris).map_err(|e| {
            DbError::CorruptRow {
                table: "products".to_string(),
                message: e.to_string(),
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO products
                (id, name, slug, api_key_hash, signing_secret, redirect_uris,
                 health_url, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&product.id)
        .bind(&product.name)
        .bind(&product.slug)
        .bind(api_key_hash)
        .bind(&product.signing_secret)
        .bind(redirect_uris)
        .bind(&product.health_url)
        .bind(product.active)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PostgridError::from(SsoError::DuplicateSlug(product.slug.clone()))
            } else {
                PostgridError::from(DbError::SqlxError(e))
            }
        })?;

        Ok(())
    }

    /// Persist name, redirect URIs, health URL and active flag
    pub async fn update_product(&self, product: &Product) -> Result<()> {
        let redirect_uris = serde_json::to_string(&product.redirect_uris).map_err(|e| {
            DbError::CorruptRow {
                table: "products".to_string(),
                message: e.to_string(),
            }
        })?;

        sqlx::query(
            r#"
            UPDATE products
            SET name = ?, redirect_uris = ?, health_url = ?, active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&product.name)
        .bind(redirect_uris)
        .bind(&product.health_url)
        .bind(product.active)
        .bind(product.updated_at)
        .bind(&product.id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn set_credentials(
        &self,
        product_id: &str,
        api_key_hash: &str,
        signing_secret: &str,
        updated_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE products SET api_key_hash = ?, signing_secret = ?, updated_at = ? WHERE id = ?",
        )
        .bind(api_key_hash)
        .bind(signing_secret)
        .bind(updated_at)
        .bind(product_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn product_where(&self, column: &str, value: &str) -> Result<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE {} = ?", PRODUCT_COLUMNS, column);
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(product_from_row).transpose()
    }

    pub async fn product_by_id(&self, id: &str) -> Result<Option<Product>> {
        self.product_where("id", id).await
    }

    pub async fn product_by_slug(&self, slug: &str) -> Result<Option<Product>> {
        self.product_where("slug", slug).await
    }

    pub async fn product_by_api_key_hash(&self, hash: &str) -> Result<Option<Product>> {
        self.product_where("api_key_hash", hash).await
    }

    pub async fn list_products(&self, include_inactive: bool) -> Result<Vec<Product>> {
        let sql = if include_inactive {
            format!("SELECT {} FROM products ORDER BY slug", PRODUCT_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM products WHERE active = 1 ORDER BY slug",
                PRODUCT_COLUMNS
            )
        };
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(product_from_row).collect()
    }

    pub async fn user_by_id(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, name, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, name, created_at FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.as_ref().map(user_from_row))
    }

    /// Insert `user` unless the email is taken; returns the stored user
    pub async fn insert_user_if_absent(&self, user: &User) -> Result<User> {
        sqlx::query(
            "INSERT INTO users (id, email, name, created_at) VALUES (?, ?, ?, ?) ON CONFLICT(email) DO NOTHING",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.user_by_email(&user.email).await?.ok_or_else(|| {
            DbError::CorruptRow {
                table: "users".to_string(),
                message: format!("user {} vanished after insert", user.email),
            }
            .into()
        })
    }

    pub async fn insert_organization(&self, organization: &Organization) -> Result<()> {
        sqlx::query(
            "INSERT INTO organizations (id, name, owner_user_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&organization.id)
        .bind(&organization.name)
        .bind(&organization.owner_user_id)
        .bind(organization.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn organization_by_id(&self, id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query(
            "SELECT id, name, owner_user_id, created_at FROM organizations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.as_ref().map(organization_from_row))
    }

    /// The oldest organization owned by `user_id`
    pub async fn personal_organization(&self, user_id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, owner_user_id, created_at FROM organizations
            WHERE owner_user_id = ?
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.as_ref().map(organization_from_row))
    }

    pub async fn mapping(&self, product_id: &str, external_id: &str) -> Result<Option<UserMapping>> {
        let sql = format!(
            "SELECT {} FROM user_mappings WHERE product_id = ? AND external_id = ?",
            MAPPING_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(product_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.as_ref().map(mapping_from_row))
    }

    /// Insert `mapping` unless the external id is already mapped; returns the stored mapping
    pub async fn insert_mapping_if_absent(&self, mapping: &UserMapping) -> Result<UserMapping> {
        sqlx::query(
            r#"
            INSERT INTO user_mappings
                (id, product_id, external_id, user_id, organization_id, email,
                 created_at, last_login_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(product_id, external_id) DO NOTHING
            "#,
        )
        .bind(&mapping.id)
        .bind(&mapping.product_id)
        .bind(&mapping.external_id)
        .bind(&mapping.user_id)
        .bind(&mapping.organization_id)
        .bind(&mapping.email)
        .bind(mapping.created_at)
        .bind(mapping.last_login_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.mapping(&mapping.product_id, &mapping.external_id)
            .await?
            .ok_or_else(|| {
                DbError::CorruptRow {
                    table: "user_mappings".to_string(),
                    message: format!("mapping {} vanished after insert", mapping.external_id),
                }
                .into()
            })
    }

    pub async fn touch_mapping(&self, mapping_id: &str, at: i64) -> Result<()> {
        sqlx::query("UPDATE user_mappings SET last_login_at = ? WHERE id = ?")
            .bind(at)
            .bind(mapping_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn mappings_for_user(&self, user_id: &str) -> Result<Vec<UserMapping>> {
        let sql = format!(
            "SELECT {} FROM user_mappings WHERE user_id = ? ORDER BY created_at ASC, id ASC",
            MAPPING_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(mapping_from_row).collect())
    }

    pub async fn delete_mapping(&self, product_id: &str, external_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM user_mappings WHERE product_id = ? AND external_id = ?")
                .bind(product_id)
                .bind(external_id)
                .execute(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_mappings(&self, product_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM user_mappings WHERE product_id = ?")
            .bind(product_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.get("n"))
    }

    pub async fn count_logins_since(&self, product_id: &str, since: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM user_mappings WHERE product_id = ? AND last_login_at >= ?",
        )
        .bind(product_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.get("n"))
    }

    pub async fn insert_audit(
        &self,
        product_id: Option<&str>,
        action: &str,
        detail: &str,
        at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (product_id, action, detail, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(product_id)
        .bind(action)
        .bind(detail)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Newest entries first
    pub async fn audit_for_product(&self, product_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, action, detail, created_at FROM audit_log
            WHERE product_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(product_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                product_id: row.get("product_id"),
                action: row.get("action"),
                detail: row.get("detail"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn insert_health(&self, health: &ProductHealth) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO product_health
                (product_id, healthy, status_code, latency_ms, error, checked_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&health.product_id)
        .bind(health.healthy)
        .bind(health.status_code.map(i64::from))
        .bind(health.latency_ms as i64)
        .bind(&health.error)
        .bind(health.checked_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn latest_health(&self, product_id: &str) -> Result<Option<ProductHealth>> {
        let row = sqlx::query(
            r#"
            SELECT product_id, healthy, status_code, latency_ms, error, checked_at
            FROM product_health
            WHERE product_id = ?
            ORDER BY checked_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|row| ProductHealth {
            product_id: row.get("product_id"),
            healthy: row.get("healthy"),
            status_code: row
                .get::<Option<i64>, _>("status_code")
                .and_then(|code| u16::try_from(code).ok()),
            latency_ms: row.get::<i64, _>("latency_ms").max(0) as u64,
            error: row.get("error"),
            checked_at: row.get("checked_at"),
        }))
    }
}

fn product_from_row(row: &SqliteRow) -> Result<Product> {
    let redirect_uris: String = row.get("redirect_uris");
    let redirect_uris = serde_json::from_str(&redirect_uris).map_err(|e| DbError::CorruptRow {
        table: "products".to_string(),
        message: format!("redirect_uris: {}", e),
    })?;

    Ok(Product {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        signing_secret: row.get("signing_secret"),
        redirect_uris,
        health_url: row.get("health_url"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn user_from_row(row: &SqliteRow) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

fn organization_from_row(row: &SqliteRow) -> Organization {
    Organization {
        id: row.get("id"),
        name: row.get("name"),
        owner_user_id: row.get("owner_user_id"),
        created_at: row.get("created_at"),
    }
}

fn mapping_from_row(row: &SqliteRow) -> UserMapping {
    UserMapping {
        id: row.get("id"),
        product_id: row.get("product_id"),
        external_id: row.get("external_id"),
        user_id: row.get("user_id"),
        organization_id: row.get("organization_id"),
        email: row.get("email"),
        created_at: row.get("created_at"),
        last_login_at: row.get("last_login_at"),
    }
}
