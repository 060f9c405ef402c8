//! SQLite implementation of [`RequestStore`].
//!
//! One embedded relational file holds every request row. Updates run in an
//! immediate transaction and are retried a bounded number of times when the
//! database is briefly locked by a concurrent writer (WAL mode keeps these
//! windows short).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::error::{Result, StratusError};
use crate::request::{
    RequestError, RequestId, RequestPayload, RequestRecord, RequestStatus, ScheduleType,
};
use crate::store::{RequestFilter, RequestStore};

/// Retries for updates that hit transient lock contention.
const UPDATE_RETRIES: u32 = 3;
const UPDATE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Get the stratus database migrator.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// SQLite-backed request store.
#[derive(Debug, Clone)]
pub struct SqliteRequestStore {
    pool: SqlitePool,
}

impl SqliteRequestStore {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteRequestStore { pool }
    }

    /// Open (creating if missing) the store file at `path`, apply
    /// migrations, and return a ready store.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        migrator().run(&pool).await?;
        Ok(SqliteRequestStore { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn try_update<F>(&self, id: RequestId, mutate: &mut F) -> Result<RequestRecord>
    where
        F: FnMut(&mut RequestRecord) -> Result<()> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM requests WHERE request_id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let mut record = match row {
            Some(row) => row_to_record(&row)?,
            None => return Err(StratusError::RequestNotFound(id)),
        };
        let previous = record.status;

        mutate(&mut record)?;

        if record.status != previous && !previous.can_transition_to(record.status) {
            // Transaction drops here, rolling back.
            return Err(StratusError::InvalidTransition {
                id,
                from: previous,
                to: record.status,
            });
        }

        sqlx::query(
            "UPDATE requests
             SET request_body = ?, status = ?, user_id = ?, pid = ?, log_path = ?,
                 return_value = ?, error = ?
             WHERE request_id = ?",
        )
        .bind(serde_json::to_vec(&record.request_body)?)
        .bind(record.status.as_str())
        .bind(record.user_id.clone())
        .bind(record.pid)
        .bind(record.log_path.to_string_lossy().into_owned())
        .bind(
            record
                .return_value
                .as_ref()
                .map(serde_json::to_vec)
                .transpose()?,
        )
        .bind(record.error.as_ref().map(serde_json::to_vec).transpose()?)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    #[tracing::instrument(skip_all, fields(request_id = %record.request_id))]
    async fn create_if_not_exists(&self, record: &RequestRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO requests
             (request_id, name, entrypoint, request_body, status, created_at,
              schedule_type, user_id, pid, log_path, return_value, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.request_id.to_string())
        .bind(&record.name)
        .bind(&record.entrypoint)
        .bind(serde_json::to_vec(&record.request_body)?)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.schedule_type.as_str())
        .bind(record.user_id.clone())
        .bind(record.pid)
        .bind(record.log_path.to_string_lossy().into_owned())
        .bind(
            record
                .return_value
                .as_ref()
                .map(serde_json::to_vec)
                .transpose()?,
        )
        .bind(record.error.as_ref().map(serde_json::to_vec).transpose()?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: RequestId) -> Result<Option<RequestRecord>> {
        let row = sqlx::query("SELECT * FROM requests WHERE request_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<RequestRecord>> {
        // Status filtering is done in SQL where possible; the status set is
        // small so a simple IN list is enough.
        let mut sql = String::from("SELECT * FROM requests");
        let mut clauses: Vec<String> = Vec::new();
        if let Some(statuses) = &filter.statuses {
            let placeholders = vec!["?"; statuses.len().max(1)].join(", ");
            clauses.push(format!("status IN ({placeholders})"));
        }
        if filter.user_id.is_some() {
            clauses.push("user_id = ?".to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, request_id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            for status in statuses {
                query = query.bind(status.as_str());
            }
        }
        if let Some(user_id) = &filter.user_id {
            query = query.bind(user_id.clone());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn update<F>(&self, id: RequestId, mut mutate: F) -> Result<RequestRecord>
    where
        F: FnMut(&mut RequestRecord) -> Result<()> + Send,
    {
        let mut attempt = 0;
        loop {
            match self.try_update(id, &mut mutate).await {
                Err(StratusError::Database(err)) if is_busy(&err) && attempt < UPDATE_RETRIES => {
                    attempt += 1;
                    tracing::debug!(
                        request_id = %id,
                        attempt,
                        "Store update hit lock contention, retrying"
                    );
                    tokio::time::sleep(UPDATE_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

fn row_to_record(row: &SqliteRow) -> Result<RequestRecord> {
    let id_text: String = row.try_get("request_id")?;
    let request_id = RequestId::from_str(&id_text)
        .map_err(|e| StratusError::Internal(format!("corrupt request_id {id_text:?}: {e}")))?;

    let status_text: String = row.try_get("status")?;
    let status = RequestStatus::from_db(&status_text)
        .ok_or_else(|| StratusError::Internal(format!("corrupt status {status_text:?}")))?;

    let schedule_text: String = row.try_get("schedule_type")?;
    let schedule_type = ScheduleType::from_db(&schedule_text)
        .ok_or_else(|| StratusError::Internal(format!("corrupt schedule_type {schedule_text:?}")))?;

    let body_bytes: Vec<u8> = row.try_get("request_body")?;
    let request_body: RequestPayload = serde_json::from_slice(&body_bytes)?;

    let return_value: Option<serde_json::Value> = row
        .try_get::<Option<Vec<u8>>, _>("return_value")?
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()?;
    let error: Option<RequestError> = row
        .try_get::<Option<Vec<u8>>, _>("error")?
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()?;

    let log_path: String = row.try_get("log_path")?;

    Ok(RequestRecord {
        request_id,
        name: row.try_get("name")?,
        entrypoint: row.try_get("entrypoint")?,
        request_body,
        status,
        created_at: row.try_get("created_at")?,
        schedule_type,
        user_id: row.try_get("user_id")?,
        pid: row.try_get("pid")?,
        log_path: log_path.into(),
        return_value,
        error,
    })
}
