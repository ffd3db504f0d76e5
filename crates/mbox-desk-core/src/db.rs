use std::{path::Path, sync::Arc};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

/// Handle to the local progress database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("remote databases are not supported for progress tracking: {0}")]
    RemoteUnsupported(String),
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let path_str = database_path.to_string_lossy();
        if is_remote(&path_str) {
            return Err(DbError::RemoteUnsupported(path_str.to_string()));
        }

        let inner = Builder::new_local(path_str.to_string())
            .build()
            .await
            .map_err(DbError::Build)?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Opens a connection where every committed statement is flushed to disk
    /// before the call returns.
    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        conn.execute("PRAGMA synchronous = FULL", ())
            .await
            .map_err(DbError::Statement)?;
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

fn is_remote(path: &str) -> bool {
    path.starts_with("libsql://") || path.starts_with("http://") || path.starts_with("https://")
}
