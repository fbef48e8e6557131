use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to open catalog: {0}")]
    ConnectionError(String),

    #[error("Migration failed: {0}")]
    MigrationError(String),

    #[error("Schema version mismatch: current {current}, target {target}")]
    SchemaVersionMismatch { current: i64, target: i64 },

    #[error("SQL error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Other error: {0}")]
    Other(String),
}
