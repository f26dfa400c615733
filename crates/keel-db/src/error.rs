//! # Database Error Types
//!
//! Error types for persistence operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)        Tracking Error (CoreError)          │
//! │       │                                   │                             │
//! │       └──────────────┬────────────────────┘                             │
//! │                      ▼                                                  │
//! │  DbError (this module) ← Adds context and categorization               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Caller of UnitOfWork / Repository / QueryBuilder                      │
//! │                                                                         │
//! │  Only UnitOfWork::change_database turns a failure into a value         │
//! │  (DatabaseSwitch). Everything else propagates.                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use keel_core::CoreError;
use thiserror::Error;

/// Persistence operation errors.
///
/// These errors wrap sqlx errors and provide additional context
/// for debugging and user feedback.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Inserting a row whose primary key already exists
    /// - Any UNIQUE index violation
    #[error("Duplicate {field}: {message}")]
    UniqueViolation {
        field: String,
        message: String,
    },

    /// Foreign key constraint violation.
    ///
    /// ## When This Occurs
    /// - Referencing a non-existent parent row
    /// - Deleting a row that is still referenced
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation {
        message: String,
    },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - Database file is opened read-only but doesn't exist
    /// - File permissions issue
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Schema bootstrap failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// A caller-supplied argument was rejected before any I/O.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is declared but has no implementation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A bounded operation ran past its deadline.
    #[error("Timed out after {millis}ms: {operation}")]
    Timeout {
        operation: String,
        millis: u64,
    },

    /// The unit of work (and its context) has been disposed.
    #[error("Unit of work has been disposed")]
    Disposed,

    /// Configuration could not be loaded or is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The change tracker rejected a mutation.
    #[error("Tracking error: {0}")]
    Tracking(#[from] CoreError),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates an InvalidArgument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        DbError::InvalidArgument(message.into())
    }

    /// Returns true for constraint violations (unique or foreign key).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DbError::UniqueViolation { .. } | DbError::ForeignKeyViolation { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
/// sqlx::Error::Configuration  → DbError::InvalidConfig
/// sqlx::Error::Io             → DbError::ConnectionFailed
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // SQLite error codes for constraints:
                // UNIQUE constraint: "UNIQUE constraint failed: <table>.<column>"
                // PRIMARY KEY on rowid tables reports the same text
                // FK constraint: "FOREIGN KEY constraint failed"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        message: msg.to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::Configuration(e) => DbError::InvalidConfig(e.to_string()),

            sqlx::Error::Io(e) => DbError::ConnectionFailed(e.to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<toml::de::Error> for DbError {
    fn from(err: toml::de::Error) -> Self {
        DbError::InvalidConfig(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
