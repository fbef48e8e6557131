use crate::db_manager::error::DatabaseError;
use crate::schemas::v1::db::{self, queries};
use colored::Colorize;
use log::{info, warn};
use sqlx::{Pool, Sqlite};

/// Current catalog schema version. Bumped whenever a numbered update below is
/// appended.
pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA_VERSION_KEY: &str = "vessel_schema_version";

/// Manages catalog schema migrations.
///
/// Two mechanisms live here:
/// - the base schema + version ladder (`update_from_v*`), the legacy
///   mechanism keyed to the schema version number, applied exactly once when
///   the version is crossed;
/// - nothing else. New data migrations go through the named patch engine in
///   `crate::patches`, never through this ladder.
pub struct MigrationManager;

impl MigrationManager {
    /// Initializes and migrates the catalog schema.
    pub async fn initialize_schema(pool: &Pool<Sqlite>) -> Result<(), DatabaseError> {
        info!("Initializing catalog schema...");

        let current = Self::current_schema_version(pool).await?;

        if current == SCHEMA_VERSION {
            info!("Schema version check: OK (version {})", current);
            return Ok(());
        }
        if current > SCHEMA_VERSION {
            return Err(DatabaseError::SchemaVersionMismatch {
                current,
                target: SCHEMA_VERSION,
            });
        }

        if current == 0 {
            // Fresh catalog: the base schema is already current, no ladder
            // steps to replay.
            db::init_schema(pool).await?;
        } else {
            warn!(
                "{}",
                format!(
                    "Schema version mismatch! Current: {}, Target: {}",
                    current, SCHEMA_VERSION
                )
                .yellow()
            );
            for version in current..SCHEMA_VERSION {
                info!("Stepping schema up from version {}", version);
                Self::update_from(version, pool).await?;
            }
        }

        queries::metadata::set_meta_value(pool, SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string())
            .await
            .map_err(|e| {
                DatabaseError::MigrationError(format!("Failed to record schema version: {}", e))
            })?;

        info!("Schema migrated from version {} to {}", current, SCHEMA_VERSION);
        Ok(())
    }

    /// Reads the recorded schema version; 0 means a fresh catalog.
    async fn current_schema_version(pool: &Pool<Sqlite>) -> Result<i64, DatabaseError> {
        let metadata_exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
        )
        .fetch_optional(pool)
        .await?
        .is_some();

        if !metadata_exists {
            return Ok(0);
        }

        let version = queries::metadata::get_meta_value(pool, SCHEMA_VERSION_KEY)
            .await
            .map_err(|e| DatabaseError::Other(e.to_string()))?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(version)
    }

    async fn update_from(version: i64, pool: &Pool<Sqlite>) -> Result<(), DatabaseError> {
        match version {
            1 => Self::update_from_v1(pool).await,
            other => Err(DatabaseError::MigrationError(format!(
                "No update step from schema version {}",
                other
            ))),
        }
    }

    /// v1 → v2: storage pool config rows gain a node scope so keys like
    /// `lvm.vg_name` can differ per cluster member.
    async fn update_from_v1(pool: &Pool<Sqlite>) -> Result<(), DatabaseError> {
        if !Self::column_exists(pool, "storage_pools_config", "node_id").await? {
            sqlx::query(
                "ALTER TABLE storage_pools_config ADD COLUMN node_id INTEGER REFERENCES nodes (id)",
            )
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    async fn column_exists(
        pool: &Pool<Sqlite>,
        table: &str,
        column: &str,
    ) -> Result<bool, DatabaseError> {
        let columns = sqlx::query_as::<_, (i64, String, String, i64, Option<String>, i64)>(
            &format!("PRAGMA table_info({})", table),
        )
        .fetch_all(pool)
        .await?;

        Ok(columns.iter().any(|(_, name, ..)| name == column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_catalog_lands_on_current_version() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MigrationManager::initialize_schema(&pool).await.unwrap();

        let version = queries::metadata::get_meta_value(&pool, SCHEMA_VERSION_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());

        // A second boot is a no-op.
        MigrationManager::initialize_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn newer_catalog_refuses_to_downgrade() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MigrationManager::initialize_schema(&pool).await.unwrap();
        queries::metadata::set_meta_value(&pool, SCHEMA_VERSION_KEY, "999")
            .await
            .unwrap();

        let err = MigrationManager::initialize_schema(&pool).await.unwrap_err();
        assert!(matches!(err, DatabaseError::SchemaVersionMismatch { .. }));
    }
}
