use super::{LOOKUP_CHUNK_SIZE, Reconciliation, ResultStore, reconcile};
use crate::error::{Error, Result};
use crate::model::{NewResult, Payload, StoredResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::path::Path;

const COLUMNS: &str =
    "id, url, owner_id, http_status, success, payload, error, search_volume, created_at";

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS fetch_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        http_status INTEGER NOT NULL,
        success INTEGER NOT NULL,
        payload TEXT,
        error TEXT,
        search_volume INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_fetch_results_owner_url
        ON fetch_results (owner_id, url, created_at DESC)",
];

pub struct SqliteStore {
    pool: SqlitePool,
    chunk_size: usize,
}

impl SqliteStore {
    pub async fn connect(path: &Path) -> Result<Self> {
        let conn_str = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&conn_str).await?;
        let store = Self {
            pool,
            chunk_size: LOOKUP_CHUNK_SIZE,
        };
        store.ensure_schema().await?;
        log::debug!("Opened result store at {}", path.display());
        Ok(store)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Every record for (url, owner), oldest first.
    pub async fn history(&self, url: &str, owner_id: &str) -> Result<Vec<StoredResult>> {
        let query = format!(
            "SELECT {} FROM fetch_results WHERE url = ?1 AND owner_id = ?2 ORDER BY created_at, id",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(url)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_result).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn latest_query() -> String {
    format!(
        "SELECT {} FROM fetch_results WHERE url = ?1 AND owner_id = ?2 \
         ORDER BY created_at DESC, id DESC LIMIT 1",
        COLUMNS
    )
}

fn row_to_result(row: &SqliteRow) -> Result<StoredResult> {
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| Error::Internal(format!("bad created_at '{}': {}", created_at, e)))?
        .with_timezone(&Utc);
    let payload: Option<String> = row.try_get("payload")?;
    let http_status: i64 = row.try_get("http_status")?;
    let search_volume: i64 = row.try_get("search_volume")?;

    Ok(StoredResult {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        owner_id: row.try_get("owner_id")?,
        http_status: u16::try_from(http_status).unwrap_or(0),
        success: row.try_get("success")?,
        payload: payload.map(Payload::new),
        error: row.try_get("error")?,
        search_volume: u64::try_from(search_volume).unwrap_or(0),
        created_at,
    })
}

/// Keeps the first row per url from rows ordered by url, newest first.
fn newest_per_url(rows: &[SqliteRow]) -> Result<Vec<StoredResult>> {
    let mut current: Vec<StoredResult> = Vec::new();
    for row in rows {
        let result = row_to_result(row)?;
        if current.last().is_none_or(|last| last.url != result.url) {
            current.push(result);
        }
    }
    Ok(current)
}

fn volume_param(volume: u64) -> i64 {
    i64::try_from(volume).unwrap_or(i64::MAX)
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn find_latest(&self, url: &str, owner_id: &str) -> Result<Option<StoredResult>> {
        let query = latest_query();
        let row = sqlx::query(&query)
            .bind(url)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_result).transpose()
    }

    async fn find_latest_batch(
        &self,
        urls: &[String],
        owner_id: &str,
    ) -> Result<Vec<StoredResult>> {
        let mut found = Vec::with_capacity(urls.len());
        for chunk in urls.chunks(self.chunk_size) {
            let placeholders = (0..chunk.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let query = format!(
                "SELECT {} FROM fetch_results WHERE owner_id = ?1 AND url IN ({}) \
                 ORDER BY url, created_at DESC, id DESC",
                COLUMNS, placeholders
            );

            let mut q = sqlx::query(&query).bind(owner_id);
            for url in chunk {
                q = q.bind(url.as_str());
            }
            let rows = q.fetch_all(&self.pool).await?;
            found.extend(newest_per_url(&rows)?);
        }
        Ok(found)
    }

    async fn upsert(&self, record: NewResult) -> Result<StoredResult> {
        let mut tx = self.pool.begin().await?;
        let query = latest_query();
        let existing = sqlx::query(&query)
            .bind(record.fetch.url.as_str())
            .bind(record.owner_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(row_to_result)
            .transpose()?;

        match (reconcile(existing.as_ref(), &record), existing) {
            (Reconciliation::Insert, _) => {
                // stored with microsecond precision
                let created_at = Utc::now().trunc_subsecs(6);
                let payload = record.fetch.payload.as_ref().map(|p| p.contents.as_str());
                let inserted = sqlx::query(
                    "INSERT INTO fetch_results \
                     (url, owner_id, http_status, success, payload, error, search_volume, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .bind(record.fetch.url.as_str())
                .bind(record.owner_id.as_str())
                .bind(i64::from(record.fetch.http_status))
                .bind(record.fetch.success)
                .bind(payload)
                .bind(record.fetch.error.as_deref())
                .bind(volume_param(record.search_volume))
                .bind(created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                Ok(StoredResult {
                    id: inserted.last_insert_rowid(),
                    url: record.fetch.url,
                    owner_id: record.owner_id,
                    http_status: record.fetch.http_status,
                    success: record.fetch.success,
                    payload: record.fetch.payload,
                    error: record.fetch.error,
                    search_volume: record.search_volume,
                    created_at,
                })
            }
            (Reconciliation::UpdateVolume, Some(mut previous)) => {
                sqlx::query("UPDATE fetch_results SET search_volume = ?1 WHERE id = ?2")
                    .bind(volume_param(record.search_volume))
                    .bind(previous.id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                previous.search_volume = record.search_volume;
                Ok(previous)
            }
            (Reconciliation::Keep, Some(previous)) => {
                tx.rollback().await?;
                Ok(previous)
            }
            (_, None) => Err(Error::Internal(format!(
                "no current record for {} to reconcile against",
                record.fetch.url
            ))),
        }
    }

    async fn update_volume_only(
        &self,
        url: &str,
        owner_id: &str,
        search_volume: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE fetch_results SET search_volume = ?1 WHERE id = (\
                SELECT id FROM fetch_results WHERE url = ?2 AND owner_id = ?3 \
                ORDER BY created_at DESC, id DESC LIMIT 1)",
        )
        .bind(volume_param(search_volume))
        .bind(url)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_current(&self, owner_id: &str) -> Result<Vec<StoredResult>> {
        let query = format!(
            "SELECT {} FROM fetch_results WHERE owner_id = ?1 ORDER BY url, created_at DESC, id DESC",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        newest_per_url(&rows)
    }
}
