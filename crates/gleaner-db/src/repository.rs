use chrono::{DateTime, Utc};
use gleaner_core::error::AppError;
use gleaner_core::models::{Category, Record};
use gleaner_core::traits::{LoadReport, RecordStore, StoreStats};
use sqlx::SqlitePool;
use sqlx::types::Json;

const RECORD_COLUMNS: &str = "url, title, author, published_at, summary, tags, category, source, \
                              scraped_at, worker_id, task_id, metadata";

/// Repository for the `records` table.
#[derive(Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load records keyed on URL, in one transaction.
    ///
    /// Unknown URLs are inserted. A known URL is overwritten only when the
    /// incoming record was scraped later than the stored one.
    pub async fn upsert_records(&self, records: &[Record]) -> Result<LoadReport, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut report = LoadReport::default();
        for record in records {
            let stored: Option<(DateTime<Utc>,)> =
                sqlx::query_as("SELECT scraped_at FROM records WHERE url = ?")
                    .bind(&record.url)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| AppError::DatabaseError(e.to_string()))?;

            match stored {
                None => {
                    let result = sqlx::query(
                        "INSERT INTO records (url, title, author, published_at, summary, tags, \
                         category, source, scraped_at, worker_id, task_id, metadata) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                         ON CONFLICT (url) DO NOTHING",
                    )
                    .bind(&record.url)
                    .bind(&record.title)
                    .bind(&record.author)
                    .bind(record.published_at)
                    .bind(&record.summary)
                    .bind(Json(&record.tags))
                    .bind(record.category.map(|c| c.as_str()))
                    .bind(&record.source)
                    .bind(record.scraped_at)
                    .bind(&record.worker_id)
                    .bind(record.task_id.and_then(|id| i64::try_from(id).ok()))
                    .bind(Json(&record.metadata))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| AppError::DatabaseError(e.to_string()))?;

                    if result.rows_affected() == 1 {
                        report.inserted += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                Some((stored_at,)) if stored_at < record.scraped_at => {
                    sqlx::query(
                        "UPDATE records SET title = ?, author = ?, published_at = ?, summary = ?, \
                         tags = ?, category = ?, source = ?, scraped_at = ?, worker_id = ?, \
                         task_id = ?, metadata = ?, \
                         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                         WHERE url = ?",
                    )
                    .bind(&record.title)
                    .bind(&record.author)
                    .bind(record.published_at)
                    .bind(&record.summary)
                    .bind(Json(&record.tags))
                    .bind(record.category.map(|c| c.as_str()))
                    .bind(&record.source)
                    .bind(record.scraped_at)
                    .bind(&record.worker_id)
                    .bind(record.task_id.and_then(|id| i64::try_from(id).ok()))
                    .bind(Json(&record.metadata))
                    .bind(&record.url)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| AppError::DatabaseError(e.to_string()))?;
                    report.updated += 1;
                }
                Some(_) => report.unchanged += 1,
            }
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            "Records loaded"
        );
        Ok(report)
    }

    /// Get a single record by URL.
    pub async fn get(&self, url: &str) -> Result<Option<Record>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Most recently scraped records first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Record>, AppError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records ORDER BY scraped_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Case-insensitive substring search over title, summary and tags,
    /// most recently scraped first. A blank term matches nothing.
    pub async fn search(&self, term: &str, limit: usize) -> Result<Vec<Record>, AppError> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", escape_like(term));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             WHERE title LIKE ? ESCAPE '\\' \
                OR summary LIKE ? ESCAPE '\\' \
                OR tags LIKE ? ESCAPE '\\' \
             ORDER BY scraped_at DESC, id DESC LIMIT ?"
        ))
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.0)
    }

    /// Totals per category (uncategorised rows under `unclassified`) and
    /// the ten most frequent sources.
    pub async fn stats(&self) -> Result<StoreStats, AppError> {
        let total_records = self.count().await?;

        let by_category: Vec<(String, i64)> = sqlx::query_as(
            "SELECT COALESCE(category, 'unclassified') AS bucket, COUNT(*) \
             FROM records GROUP BY bucket ORDER BY bucket",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let top_sources: Vec<(String, i64)> = sqlx::query_as(
            "SELECT source, COUNT(*) AS n FROM records WHERE source IS NOT NULL \
             GROUP BY source ORDER BY n DESC, source ASC LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(StoreStats {
            total_records,
            by_category: by_category.into_iter().collect(),
            top_sources,
        })
    }

    /// Simple connectivity check.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

impl RecordStore for RecordRepository {
    async fn upsert_records(&self, records: &[Record]) -> Result<LoadReport, AppError> {
        RecordRepository::upsert_records(self, records).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Record>, AppError> {
        RecordRepository::recent(self, limit).await
    }

    async fn stats(&self) -> Result<StoreStats, AppError> {
        RecordRepository::stats(self).await
    }
}

/// Escape `LIKE` wildcards so the term matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ---------------------------------------------------------------------------
// Internal row type for sqlx mapping
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct RecordRow {
    url: String,
    title: String,
    author: Option<String>,
    published_at: Option<DateTime<Utc>>,
    summary: Option<String>,
    tags: Json<Vec<String>>,
    category: Option<String>,
    source: Option<String>,
    scraped_at: DateTime<Utc>,
    worker_id: Option<String>,
    task_id: Option<i64>,
    metadata: Json<serde_json::Map<String, serde_json::Value>>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            url: row.url,
            title: row.title,
            author: row.author,
            published_at: row.published_at,
            summary: row.summary,
            tags: row.tags.0,
            // Rows written by other tools may carry categories we don't know.
            category: row.category.and_then(|c| c.parse::<Category>().ok()),
            source: row.source,
            scraped_at: row.scraped_at,
            worker_id: row.worker_id,
            task_id: row.task_id.and_then(|id| u64::try_from(id).ok()),
            metadata: row.metadata.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("rust"), "rust");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like(r"a\b"), r"a\\b");
    }
}
