use crate::db_manager::connection::ConnectionManager;
use crate::db_manager::error::DatabaseError;
use crate::db_manager::migration::MigrationManager;
use sqlx::{Pool, Sqlite};
use std::path::Path;

/// Central manager for catalog access.
///
/// Opening the manager brings the schema up to date; the named patch engine
/// (which also needs drivers and the driver cache) runs separately from
/// `main` before the HTTP listener opens.
pub struct DatabaseManager {
    connection_manager: ConnectionManager,
}

impl DatabaseManager {
    pub async fn new(data_dir: &Path) -> Result<Self, DatabaseError> {
        let connection_manager = ConnectionManager::new(data_dir).await?;
        let manager = Self { connection_manager };

        MigrationManager::initialize_schema(manager.get_pool()).await?;

        Ok(manager)
    }

    /// In-memory catalog with a current schema, used by tests.
    pub async fn new_in_memory() -> Result<Self, DatabaseError> {
        let connection_manager = ConnectionManager::in_memory().await?;
        let manager = Self { connection_manager };

        MigrationManager::initialize_schema(manager.get_pool()).await?;

        Ok(manager)
    }

    pub fn get_pool(&self) -> &Pool<Sqlite> {
        self.connection_manager.pool()
    }
}
