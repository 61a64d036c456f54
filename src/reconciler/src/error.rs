//! Error taxonomy for reconciliation runs.

use serde::{Deserialize, Serialize};
use sqlx::error::ErrorKind as DbErrorKind;
use sqlx::mysql::MySqlDatabaseError;

/// Errors raised while finding or merging duplicate groups.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The store is temporarily unavailable (lock wait, deadlock, dropped connection).
    #[error("Store connection error: {0}")]
    ConnectionError(String),

    /// A reference to a loser survived repointing, or the store rejected a write.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A survivor or loser disappeared while its group was being merged.
    #[error("Row not found: {0}")]
    NotFoundError(String),

    /// The entity definition or its relation registry is invalid or incomplete.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),
}

/// Result type for reconciliation operations
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Serializable classification of a [`ReconcileError`], used in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    ConstraintViolation,
    NotFound,
    Configuration,
    Database,
}

impl ReconcileError {
    /// Transient errors are worth retrying; everything else fails the group at once.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::ConnectionError(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ReconcileError::ConnectionError(_) => FailureKind::Connection,
            ReconcileError::ConstraintViolation(_) => FailureKind::ConstraintViolation,
            ReconcileError::NotFoundError(_) => FailureKind::NotFound,
            ReconcileError::ConfigurationError(_) => FailureKind::Configuration,
            ReconcileError::Database(_) => FailureKind::Database,
        }
    }
}

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => ReconcileError::ConnectionError(err.to_string()),
            sqlx::Error::RowNotFound => ReconcileError::NotFoundError(err.to_string()),
            sqlx::Error::Database(db_err) => {
                if is_transient_database_error(&**db_err) {
                    return ReconcileError::ConnectionError(err.to_string());
                }
                match db_err.kind() {
                    DbErrorKind::ForeignKeyViolation
                    | DbErrorKind::UniqueViolation
                    | DbErrorKind::NotNullViolation
                    | DbErrorKind::CheckViolation => {
                        ReconcileError::ConstraintViolation(err.to_string())
                    }
                    _ => ReconcileError::Database(err),
                }
            }
            _ => ReconcileError::Database(err),
        }
    }
}

/// SQLSTATE / SQLite result codes that signal lock contention or a lost connection.
const TRANSIENT_CODES: &[&str] = &[
    // SQLite: SQLITE_BUSY, SQLITE_LOCKED and their extended forms
    "5", "6", "261", "517", "262",
    // PostgreSQL: serialization failure, deadlock, lock not available
    "40001", "40P01", "55P03",
    // PostgreSQL: connection exceptions and admin shutdown
    "08000", "08003", "08006", "57P01",
];

fn is_transient_database_error(db_err: &dyn sqlx::error::DatabaseError) -> bool {
    // MySQL reports lock wait timeouts under the generic HY000 state.
    if let Some(mysql_err) = db_err.try_downcast_ref::<MySqlDatabaseError>() {
        return matches!(mysql_err.number(), 1205 | 1213 | 2006 | 2013);
    }

    if let Some(code) = db_err.code()
        && TRANSIENT_CODES.contains(&code.as_ref())
    {
        return true;
    }

    db_err.message().contains("database is locked")
}
