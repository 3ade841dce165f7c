//! Sqlite task store.
//!
//! Schema:
//!
//! - `PARAM(KEY, VALUE)` — holds the `dbversion` parameter, written on first
//!   open. A version mismatch aborts startup.
//! - `TASKLIST(ID integer pk autoincrement, TIMESTAMP, STATUS, SER)` — one
//!   row per task; `ID` is the authoritative source of monotonic ordering.
//!
//! The pool is capped at a single connection: the dispatcher is the only
//! writer, and sqlite busy conditions are retried with a bounded 1-second
//! backoff rather than surfaced.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};

use kiln_kernel::store::{STORE_VERSION, StoreError, TaskStore, transition_allowed};
use kiln_kernel::task::{Task, TaskStatus};

const STMT_INSERT: &str = "INSERT INTO TASKLIST (TIMESTAMP, STATUS, SER) VALUES (?, ?, ?)";
const STMT_SELECT_STATUS: &str = "SELECT STATUS FROM TASKLIST WHERE ID = ?";
const STMT_UPDATE_STATUS: &str = "UPDATE TASKLIST SET STATUS = ? WHERE ID = ?";
const STMT_SELECT_BY_STATUS: &str =
    "SELECT ID, TIMESTAMP, STATUS, SER FROM TASKLIST WHERE STATUS = ? ORDER BY ID ASC";
const STMT_SELECT_LIVE: &str =
    "SELECT ID, TIMESTAMP, STATUS, SER FROM TASKLIST WHERE STATUS >= 0 ORDER BY ID ASC";

const BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_secs(1);

fn is_busy(err: &sqlx::Error) -> bool {
    // SQLITE_BUSY (5), SQLITE_LOCKED (6) and their extended codes.
    matches!(err, sqlx::Error::Database(db)
        if matches!(db.code().as_deref(), Some("5" | "6" | "261" | "517")))
}

async fn retry<T, F, Fut>(what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) => {
                if attempts >= BUSY_RETRIES {
                    return Err(StoreError::Busy);
                }
                attempts += 1;
                tracing::info!(what, "task store is busy, waiting one second");
                tokio::time::sleep(BUSY_BACKOFF).await;
            }
            Err(e) => return Err(StoreError::Backend(e.to_string())),
        }
    }
}

/// Task store backed by a sqlite database file.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) the store at `path` and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] when the file cannot be opened and
    /// [`StoreError::Incompatible`] when it was written by another schema
    /// version; both are fatal at startup.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(BUSY_BACKOFF);
        Self::connect(options).await
    }

    /// An ephemeral store, for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect(SqliteConnectOptions::new().in_memory(true)).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // Single writer; a second connection would only ever see "busy".
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { pool };
        store.install().await?;
        Ok(store)
    }

    async fn install(&self) -> Result<(), StoreError> {
        let pool = &self.pool;

        retry("create param table", || async move {
            sqlx::query("CREATE TABLE IF NOT EXISTS PARAM (KEY NOT NULL, VALUE NOT NULL)")
                .execute(pool)
                .await
        })
        .await?;

        let version = retry("read dbversion", || async move {
            sqlx::query("SELECT VALUE FROM PARAM WHERE KEY = 'dbversion'")
                .fetch_optional(pool)
                .await
        })
        .await?;

        match version {
            Some(row) => {
                let found: i64 = row
                    .try_get(0)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                if found != STORE_VERSION {
                    return Err(StoreError::Incompatible { found, expected: STORE_VERSION });
                }
            }
            None => {
                tracing::info!(version = STORE_VERSION, "installing task store schema");
                retry("write dbversion", || async move {
                    sqlx::query("INSERT INTO PARAM (KEY, VALUE) VALUES ('dbversion', ?)")
                        .bind(STORE_VERSION)
                        .execute(pool)
                        .await
                })
                .await?;
            }
        }

        retry("create tasklist table", || async move {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS TASKLIST (\
                 ID INTEGER PRIMARY KEY AUTOINCREMENT, \
                 TIMESTAMP INTEGER NOT NULL, \
                 STATUS INTEGER NOT NULL, \
                 SER NOT NULL)",
            )
            .execute(pool)
            .await
        })
        .await?;

        Ok(())
    }

    fn parse_row(row: &SqliteRow) -> Result<Task, StoreError> {
        let id: i64 = row.try_get("ID").map_err(|e| StoreError::Backend(e.to_string()))?;
        let timestamp: i64 = row
            .try_get("TIMESTAMP")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let status_code: i64 = row
            .try_get("STATUS")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let ser: String = row.try_get("SER").map_err(|e| StoreError::Backend(e.to_string()))?;

        let status = TaskStatus::from_code(status_code)
            .ok_or_else(|| StoreError::Backend(format!("unknown status code {status_code}")))?;
        let timestamp = DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_default();

        Task::deserialize(id as u64, timestamp, status, &ser)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Parse rows, logging and skipping the corrupt ones.
    fn parse_rows(rows: &[SqliteRow]) -> Vec<Task> {
        rows.iter()
            .filter_map(|row| match Self::parse_row(row) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::error!(error = %e, "skipping corrupt task row");
                    None
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn status_of(&self, id: u64) -> Option<TaskStatus> {
        let row = sqlx::query(STMT_SELECT_STATUS)
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .ok()??;
        TaskStatus::from_code(row.try_get::<i64, _>(0).ok()?)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &mut Task) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let timestamp = task.timestamp().timestamp();
        let status = task.status().code();
        let ser = task.serialize();

        let id = retry("insert task", || {
            let ser = ser.clone();
            async move {
                sqlx::query(STMT_INSERT)
                    .bind(timestamp)
                    .bind(status)
                    .bind(ser)
                    .execute(pool)
                    .await
                    .map(|done| done.last_insert_rowid())
            }
        })
        .await?;

        task.set_id(id as u64);
        Ok(id as u64)
    }

    async fn update_status(&self, id: u64, status: TaskStatus) -> Result<(), StoreError> {
        let pool = &self.pool;

        let row = retry("read task status", || async move {
            sqlx::query(STMT_SELECT_STATUS)
                .bind(id as i64)
                .fetch_optional(pool)
                .await
        })
        .await?;

        let Some(row) = row else {
            return Err(StoreError::UnknownTask(id));
        };
        let code: i64 = row.try_get(0).map_err(|e| StoreError::Backend(e.to_string()))?;
        let from = TaskStatus::from_code(code)
            .ok_or_else(|| StoreError::Backend(format!("unknown status code {code}")))?;

        if !transition_allowed(from, status) {
            return Err(StoreError::IllegalTransition { id, from, to: status });
        }

        retry("update task status", || async move {
            sqlx::query(STMT_UPDATE_STATUS)
                .bind(status.code())
                .bind(id as i64)
                .execute(pool)
                .await
        })
        .await?;

        Ok(())
    }

    async fn load_new(&self) -> Result<Vec<Task>, StoreError> {
        let pool = &self.pool;
        let rows = retry("load pending tasks", || async move {
            sqlx::query(STMT_SELECT_BY_STATUS)
                .bind(TaskStatus::New.code())
                .fetch_all(pool)
                .await
        })
        .await?;

        Ok(Self::parse_rows(&rows))
    }

    async fn find_active(&self, descriptor: &Value) -> Result<Option<Task>, StoreError> {
        let pool = &self.pool;
        let rows = retry("load live tasks", || async move {
            sqlx::query(STMT_SELECT_LIVE).fetch_all(pool).await
        })
        .await?;

        Ok(Self::parse_rows(&rows)
            .into_iter()
            .find(|task| kiln_kernel::json::structural_eq(task.descriptor(), descriptor)))
    }
}
