use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row, params};
use thiserror::Error;

use crate::db::{Database, DbError};

const RECORD_COLUMNS: &str =
    "thread_id, remote_ticket_id, status, last_message_index_applied, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    InProgress,
    Complete,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::InProgress => "in_progress",
            ImportStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = ProgressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "in_progress" => Ok(ImportStatus::InProgress),
            "complete" => Ok(ImportStatus::Complete),
            other => Err(ProgressError::InvalidStatus(other.to_string())),
        }
    }
}

/// Durable progress for one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub thread_id: String,
    pub remote_ticket_id: String,
    pub status: ImportStatus,
    /// Number of the thread's messages confirmed remotely, opener included.
    pub last_message_index_applied: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub remote_ticket_id: String,
    pub last_message_index_applied: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub in_progress: u64,
    pub complete: u64,
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid stored status: {0}")]
    InvalidStatus(String),
    #[error("invalid stored message index {0}")]
    InvalidIndex(i64),
    #[error("no import record for thread {0}")]
    NotFound(String),
    #[error("thread {0} is already complete")]
    AlreadyComplete(String),
    #[error("thread {thread_id}: index {requested} does not advance past {current}")]
    NonMonotonic {
        thread_id: String,
        current: u32,
        requested: u32,
    },
}

/// Per-thread import progress, persisted in `import_records`.
///
/// Every mutation is a single autocommitted statement on a
/// `synchronous = FULL` connection, so it is on disk when the call returns.
#[derive(Clone)]
pub struct ProgressStore {
    db: Database,
}

impl ProgressStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn is_complete(&self, thread_id: &str) -> Result<bool, ProgressError> {
        Ok(self
            .get(thread_id)
            .await?
            .is_some_and(|record| record.status == ImportStatus::Complete))
    }

    /// Last confirmed state of a thread that was started but not finished.
    pub async fn resume_point(&self, thread_id: &str) -> Result<Option<ResumePoint>, ProgressError> {
        Ok(self.get(thread_id).await?.and_then(|record| {
            (record.status == ImportStatus::InProgress).then(|| ResumePoint {
                remote_ticket_id: record.remote_ticket_id,
                last_message_index_applied: record.last_message_index_applied,
            })
        }))
    }

    pub async fn get(&self, thread_id: &str) -> Result<Option<ImportRecord>, ProgressError> {
        let conn = self.db.connection().await?;
        fetch(&conn, thread_id).await
    }

    /// Stores the remote ticket for a thread whose opener was just accepted.
    pub async fn record_ticket_created(
        &self,
        thread_id: &str,
        remote_ticket_id: &str,
    ) -> Result<ImportRecord, ProgressError> {
        let conn = self.db.connection().await?;
        let now = now_rfc3339();
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO import_records (thread_id, remote_ticket_id, status, last_message_index_applied, created_at, updated_at)
                     VALUES (?1, ?2, 'in_progress', 1, ?3, ?3)
                     ON CONFLICT(thread_id) DO UPDATE SET
                        remote_ticket_id = excluded.remote_ticket_id,
                        status = 'in_progress',
                        last_message_index_applied = 1,
                        updated_at = excluded.updated_at
                     WHERE import_records.status = 'in_progress'
                       AND import_records.last_message_index_applied <= 1
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![thread_id, remote_ticket_id, now],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            return row_to_record(row);
        }
        drop(rows);

        Err(rejection(&conn, thread_id, 1).await)
    }

    /// Advances the applied-message count. Rejects anything that does not move
    /// it forward.
    pub async fn record_reply_applied(
        &self,
        thread_id: &str,
        new_index: u32,
    ) -> Result<ImportRecord, ProgressError> {
        let conn = self.db.connection().await?;
        let now = now_rfc3339();
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE import_records
                     SET last_message_index_applied = ?2, updated_at = ?3
                     WHERE thread_id = ?1
                       AND status = 'in_progress'
                       AND last_message_index_applied < ?2
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![thread_id, i64::from(new_index), now],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            return row_to_record(row);
        }
        drop(rows);

        Err(rejection(&conn, thread_id, new_index).await)
    }

    pub async fn mark_complete(&self, thread_id: &str) -> Result<ImportRecord, ProgressError> {
        let conn = self.db.connection().await?;
        let now = now_rfc3339();
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE import_records
                     SET status = 'complete',
                         updated_at = CASE WHEN status = 'complete' THEN updated_at ELSE ?2 END
                     WHERE thread_id = ?1
                     RETURNING {RECORD_COLUMNS}"
                ),
                params![thread_id, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_record(row),
            None => Err(ProgressError::NotFound(thread_id.to_string())),
        }
    }

    /// Erases every record. Irreversible.
    pub async fn purge(&self) -> Result<u64, ProgressError> {
        let conn = self.db.connection().await?;
        let removed = conn.execute("DELETE FROM import_records", ()).await?;
        Ok(removed)
    }

    pub async fn counts(&self) -> Result<ProgressCounts, ProgressError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM import_records GROUP BY status",
                (),
            )
            .await?;
        let mut counts = ProgressCounts::default();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<ImportStatus>()? {
                ImportStatus::InProgress => counts.in_progress = count,
                ImportStatus::Complete => counts.complete = count,
            }
        }
        Ok(counts)
    }
}

async fn fetch(conn: &Connection, thread_id: &str) -> Result<Option<ImportRecord>, ProgressError> {
    let mut rows = conn
        .query(
            &format!("SELECT {RECORD_COLUMNS} FROM import_records WHERE thread_id = ?1"),
            params![thread_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => row_to_record(row).map(Some),
        None => Ok(None),
    }
}

/// Explains why a guarded write matched no row.
async fn rejection(conn: &Connection, thread_id: &str, requested: u32) -> ProgressError {
    match fetch(conn, thread_id).await {
        Ok(None) => ProgressError::NotFound(thread_id.to_string()),
        Ok(Some(record)) if record.status == ImportStatus::Complete => {
            ProgressError::AlreadyComplete(thread_id.to_string())
        }
        Ok(Some(record)) => ProgressError::NonMonotonic {
            thread_id: thread_id.to_string(),
            current: record.last_message_index_applied,
            requested,
        },
        Err(err) => err,
    }
}

fn row_to_record(row: Row) -> Result<ImportRecord, ProgressError> {
    let status: String = row.get(2)?;
    let index: i64 = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(ImportRecord {
        thread_id: row.get(0)?,
        remote_ticket_id: row.get(1)?,
        status: status.parse()?,
        last_message_index_applied: u32::try_from(index)
            .map_err(|_| ProgressError::InvalidIndex(index))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
