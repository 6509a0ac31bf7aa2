use std::time::Duration;

use crate::utils::IsTransient;

// ============================================================================
// Aggregation Store Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] sqlx::Error),

    #[error("Concurrent transaction conflict: {0}")]
    Conflict(#[source] sqlx::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Stored row cannot be decoded: {0}")]
    CorruptRow(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,
}

/// SQLSTATE codes Postgres uses when a transaction lost a race and can
/// simply be run again.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// SQLSTATE class for connection exceptions.
const CONNECTION_EXCEPTION_CLASS: &str = "08";

enum DatabaseErrorKind {
    Conflict,
    Constraint(String),
    Connection,
    Other,
}

fn classify_database_error(error: &dyn sqlx::error::DatabaseError) -> DatabaseErrorKind {
    let code = error.code().map(|c| c.into_owned()).unwrap_or_default();

    if code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED {
        return DatabaseErrorKind::Conflict;
    }
    if code.starts_with(CONNECTION_EXCEPTION_CLASS) {
        return DatabaseErrorKind::Connection;
    }
    if error.is_unique_violation() || error.is_check_violation() || error.is_foreign_key_violation() {
        let constraint = error.constraint().unwrap_or("unknown");
        return DatabaseErrorKind::Constraint(format!(
            "{} (constraint: {})",
            error.message(),
            constraint
        ));
    }
    DatabaseErrorKind::Other
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        let kind = match &error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => DatabaseErrorKind::Connection,
            sqlx::Error::Database(db) => classify_database_error(&**db),
            _ => DatabaseErrorKind::Other,
        };

        match kind {
            DatabaseErrorKind::Connection => StoreError::StorageUnavailable(error),
            DatabaseErrorKind::Conflict => StoreError::Conflict(error),
            DatabaseErrorKind::Constraint(detail) => StoreError::ConstraintViolation(detail),
            DatabaseErrorKind::Other => StoreError::Database(error),
        }
    }
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::StorageUnavailable(_) | StoreError::Conflict(_)
        )
    }
}
