//! # Entity Metadata
//!
//! The mapping contract every persisted record type implements.
//!
//! ## What An Entity Declares
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       impl Entity for DimFund                           │
//! │                                                                         │
//! │   TABLE         = "dim_fund"                                           │
//! │   KEY           = "fund_key"          (single primary-key column)      │
//! │   KEY_GENERATED = false               (true → INTEGER PRIMARY KEY)     │
//! │   COLUMNS       = ["fund_key", "fund_name"]                            │
//! │                                                                         │
//! │   key()      → Value::Text("Fund1")                                    │
//! │   values()   → [Text("Fund1"), Text("AustralianSuper")]                │
//! │   from_key() → Some(placeholder)      (enables delete without fetch)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Row decoding is not part of this trait; the database crate pairs it with
//! `sqlx::FromRow`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A record type mapped to one table with a single-column primary key.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Table name.
    const TABLE: &'static str;

    /// Primary-key column. Must appear in [`Entity::COLUMNS`].
    const KEY: &'static str;

    /// Whether the store assigns the key on insert (`INTEGER PRIMARY KEY`).
    ///
    /// When true, an insert whose key is unset (NULL or 0) omits the key
    /// column and lets SQLite assign the next rowid.
    const KEY_GENERATED: bool = false;

    /// Persisted columns, in the order [`Entity::values`] returns them.
    const COLUMNS: &'static [&'static str];

    /// The primary-key value of this instance.
    fn key(&self) -> Value;

    /// Column values, aligned with [`Entity::COLUMNS`].
    fn values(&self) -> Vec<Value>;

    /// Builds a placeholder carrying only the given key.
    ///
    /// Types that return `Some` can be deleted by key without a prior read.
    /// The default returns `None`, which makes key-only deletes fetch first.
    fn from_key(_key: Value) -> Option<Self> {
        None
    }
}

/// Lifecycle state of an entity inside one change tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Known to the context, no pending change.
    Unchanged,
    /// Queued for INSERT.
    Added,
    /// Queued for UPDATE.
    Modified,
    /// Queued for DELETE.
    Deleted,
    /// Not tracked.
    Detached,
}

impl EntityState {
    /// Returns true when saving would issue a statement for this state.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityState::Unchanged => write!(f, "unchanged"),
            EntityState::Added => write!(f, "added"),
            EntityState::Modified => write!(f, "modified"),
            EntityState::Deleted => write!(f, "deleted"),
            EntityState::Detached => write!(f, "detached"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_states() {
        assert!(EntityState::Added.is_pending());
        assert!(EntityState::Modified.is_pending());
        assert!(EntityState::Deleted.is_pending());
        assert!(!EntityState::Unchanged.is_pending());
        assert!(!EntityState::Detached.is_pending());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&EntityState::Modified).unwrap();
        assert_eq!(json, r#""modified""#);
    }
}
