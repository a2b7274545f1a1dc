//! Database operations for Postgrid

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{PublishRecord, PublishStatus};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file on first use
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append a publish outcome, returning its row id
    pub async fn create_publish_record(&self, record: &PublishRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO publish_records
                (job_id, integration_id, provider, post_id, network_post_id,
                 release_url, status, error_message, attempts, published_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.job_id)
        .bind(&record.integration_id)
        .bind(&record.provider)
        .bind(&record.post_id)
        .bind(&record.network_post_id)
        .bind(&record.release_url)
        .bind(record.status.as_str())
        .bind(&record.error_message)
        .bind(record.attempts as i64)
        .bind(record.published_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    /// Records written for one publish job, in insertion order
    pub async fn get_publish_records(&self, job_id: &str) -> Result<Vec<PublishRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, integration_id, provider, post_id, network_post_id,
                   release_url, status, error_message, attempts, published_at
            FROM publish_records
            WHERE job_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(publish_record_from_row).collect()
    }

    /// Most recent records for an integration
    pub async fn records_for_integration(
        &self,
        integration_id: &str,
        limit: usize,
    ) -> Result<Vec<PublishRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, integration_id, provider, post_id, network_post_id,
                   release_url, status, error_message, attempts, published_at
            FROM publish_records
            WHERE integration_id = ?
            ORDER BY published_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(integration_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(publish_record_from_row).collect()
    }
}

fn publish_record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PublishRecord> {
    let status = match row.get::<String, _>("status").as_str() {
        "published" => PublishStatus::Published,
        "failed" => PublishStatus::Failed,
        other => {
            return Err(DbError::CorruptRow {
                table: "publish_records".to_string(),
                message: format!("unknown status '{}'", other),
            }
            .into())
        }
    };

    Ok(PublishRecord {
        id: Some(row.get("id")),
        job_id: row.get("job_id"),
        integration_id: row.get("integration_id"),
        provider: row.get("provider"),
        post_id: row.get("post_id"),
        network_post_id: row.get("network_post_id"),
        release_url: row.get("release_url"),
        status,
        error_message: row.get("error_message"),
        attempts: row.get::<i64, _>("attempts") as u32,
        published_at: row.get("published_at"),
    })
}
