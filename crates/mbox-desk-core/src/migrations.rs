use libsql::{Connection, params};
use thiserror::Error;

use crate::db::{Database, DbError};

/// Schema files in apply order, keyed by version name.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_import_records",
    include_str!("../../../migrations/001_import_records.sql"),
)];

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration failed: {0}")]
    LibSql(#[from] libsql::Error),
    #[error("progress database has schema version {0}, which this build does not know")]
    UnknownVersion(String),
}

/// Brings the progress database schema up to date. Safe to call on every start.
pub async fn run_migrations(db: &Database) -> Result<(), MigrationError> {
    let conn = db.connection().await?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await?;

    let applied = versions(&conn).await?;
    if let Some(unknown) = applied
        .iter()
        .find(|version| !MIGRATIONS.iter().any(|(known, _)| known == version))
    {
        return Err(MigrationError::UnknownVersion(unknown.clone()));
    }

    for (version, sql) in MIGRATIONS {
        if applied.iter().any(|done| done == version) {
            continue;
        }

        let tx = conn.transaction().await?;
        tx.execute_batch(sql).await?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at)
             VALUES (?1, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
            params![*version],
        )
        .await?;
        tx.commit().await?;
        tracing::info!(version, "applied progress schema migration");
    }

    Ok(())
}

/// Versions recorded in `schema_migrations`, oldest first.
pub async fn applied_versions(db: &Database) -> Result<Vec<String>, MigrationError> {
    let conn = db.connection().await?;
    versions(&conn).await
}

async fn versions(conn: &Connection) -> Result<Vec<String>, MigrationError> {
    let mut rows = conn
        .query("SELECT version FROM schema_migrations ORDER BY version", ())
        .await?;
    let mut versions = Vec::new();
    while let Some(row) = rows.next().await? {
        versions.push(row.get::<String>(0)?);
    }
    Ok(versions)
}
