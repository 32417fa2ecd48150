//! SQLite connection pool for the vector store.
//!
//! WAL journaling keeps the read-only query path responsive while the
//! ingestion coordinator writes, and foreign keys are enforced so chunk
//! rows cannot outlive their document.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::DbConfig;

/// Open (creating if necessary) the database configured in `[db]`.
pub async fn connect(db: &DbConfig) -> Result<SqlitePool> {
    if let Some(parent) = db.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&db.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("opening database {}", db.path.display()))?;

    Ok(pool)
}
