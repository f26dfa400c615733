//! # Error Types
//!
//! Errors raised while turning entities into tracked entries.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  keel-core errors (this file)                                          │
//! │  └── CoreError        - Metadata / tracking rule violations            │
//! │                                                                         │
//! │  keel-db errors (separate crate)                                       │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  Flow: CoreError → DbError::Tracking → caller                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::value::Value;

/// Change-tracking and metadata errors.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    /// `Entity::values()` did not line up with `Entity::COLUMNS`.
    ///
    /// ## When This Occurs
    /// - A column was added to `COLUMNS` but not to `values()` (or vice versa)
    #[error("{table}: entity produced {actual} values for {expected} columns")]
    ColumnMismatch {
        table: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The key column is not part of `Entity::COLUMNS`.
    #[error("{table}: key column '{column}' is not a mapped column")]
    UnmappedKey {
        table: &'static str,
        column: &'static str,
    },

    /// Update or delete requested for an entity without a key value.
    #[error("{table}: cannot {operation} an entity without a key value")]
    MissingKey {
        table: &'static str,
        operation: &'static str,
    },

    /// The same key was inserted twice into one change tracker.
    #[error("{table}: an entity with key {key} is already tracked")]
    AlreadyTracked { table: &'static str, key: Value },
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::ColumnMismatch {
            table: "dim_fund",
            expected: 2,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "dim_fund: entity produced 3 values for 2 columns"
        );

        let err = CoreError::AlreadyTracked {
            table: "dim_fund",
            key: Value::from("Fund1"),
        };
        assert_eq!(
            err.to_string(),
            "dim_fund: an entity with key 'Fund1' is already tracked"
        );
    }
}
