use rocket::http::Status;
use thiserror::Error;

/// Errors surfaced by the storage core.
///
/// Catalog query modules report through `anyhow`; the manager boundary
/// translates those into this taxonomy so API handlers can map each variant
/// to an HTTP status without inspecting strings.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    /// Retryable store contention. The retry wrapper in `db_manager::retry`
    /// absorbs these up to its bound; a surviving one becomes a 500.
    #[error("Database is busy: {0}")]
    Transient(String),

    /// Filesystem or external-command failure from a driver. Surfaced
    /// verbatim, never retried.
    #[error("{0}")]
    Driver(String),

    /// Raised only while patches run at boot; aborts startup.
    #[error("Patch {name} failed: {reason}")]
    Patch { name: String, reason: String },

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl StorageError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        StorageError::NotFound(what.to_string())
    }

    /// HTTP status this error maps to at the API boundary.
    pub fn status(&self) -> Status {
        match self {
            StorageError::NotFound(_) => Status::NotFound,
            StorageError::Conflict(_) => Status::Conflict,
            StorageError::Validation(_) => Status::BadRequest,
            StorageError::Transient(_)
            | StorageError::Driver(_)
            | StorageError::Patch { .. }
            | StorageError::Database(_) => Status::InternalServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_error_kind() {
        assert_eq!(StorageError::not_found("Pool p1").status(), Status::NotFound);
        assert_eq!(
            StorageError::Conflict("in use".into()).status(),
            Status::Conflict
        );
        assert_eq!(
            StorageError::Validation("bad key".into()).status(),
            Status::BadRequest
        );
        assert_eq!(
            StorageError::Driver("mkfs failed".into()).status(),
            Status::InternalServerError
        );
    }
}
