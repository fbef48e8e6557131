use crate::db_manager::error::DatabaseError;
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;

/// Manages the connection pool to the embedded catalog database.
pub struct ConnectionManager {
    pool: Pool<Sqlite>,
}

impl ConnectionManager {
    /// Opens (creating if necessary) the catalog under the daemon data
    /// directory.
    pub async fn new(data_dir: &Path) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        let db_path = data_dir.join("vessel.db");
        info!("Opening catalog at {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("✓ Catalog connection established");

        Ok(Self { pool })
    }

    /// In-memory catalog, used by tests.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
