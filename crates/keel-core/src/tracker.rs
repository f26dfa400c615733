//! # Change Tracker
//!
//! Queues inserts, updates and deletes in memory until a unit of work saves.
//!
//! ## State Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 Tracked state after each operation                      │
//! │                                                                         │
//! │   current ╲ op │   add            update          remove               │
//! │  ──────────────┼─────────────────────────────────────────────────────  │
//! │   Detached     │   Added          Modified        Deleted              │
//! │   Added        │   error          Added (new vals) Detached (dropped)  │
//! │   Modified     │   error          Modified        Deleted              │
//! │   Deleted      │   Modified       Modified        Deleted              │
//! │                                                                         │
//! │  Inserts with an unset store-generated key are never merged: each one  │
//! │  is its own Added entry.                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries keep queue order, which is the order statements run in on save.

use std::collections::HashMap;

use crate::entity::{Entity, EntityState};
use crate::error::{CoreError, CoreResult};
use crate::query::{placeholders, quote_ident, Statement};
use crate::value::Value;

/// One pending change.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub table: &'static str,
    pub key_column: &'static str,
    pub columns: &'static [&'static str],
    pub key_generated: bool,
    pub key: Value,
    pub values: Vec<Value>,
    pub state: EntityState,
}

impl Entry {
    /// Captures an entity's current values.
    pub fn of<T: Entity>(entity: &T, state: EntityState) -> CoreResult<Self> {
        let values = entity.values();
        if values.len() != T::COLUMNS.len() {
            return Err(CoreError::ColumnMismatch {
                table: T::TABLE,
                expected: T::COLUMNS.len(),
                actual: values.len(),
            });
        }
        if !T::COLUMNS.contains(&T::KEY) {
            return Err(CoreError::UnmappedKey {
                table: T::TABLE,
                column: T::KEY,
            });
        }

        Ok(Entry {
            table: T::TABLE,
            key_column: T::KEY,
            columns: T::COLUMNS,
            key_generated: T::KEY_GENERATED,
            key: entity.key(),
            values,
            state,
        })
    }

    /// `(table, key)` when this entry can be matched against later ones.
    pub fn identity(&self) -> Option<(&'static str, Value)> {
        if self.key.is_null() || (self.key_generated && self.key.is_unset_key()) {
            None
        } else {
            Some((self.table, self.key.clone()))
        }
    }

    /// The statement saving this entry runs, if any.
    pub fn statement(&self) -> Option<Statement> {
        match self.state {
            EntityState::Added => Some(self.insert_statement()),
            EntityState::Modified => self.update_statement(),
            EntityState::Deleted => Some(Statement::new(
                format!(
                    "DELETE FROM {} WHERE {} = ?",
                    quote_ident(self.table),
                    quote_ident(self.key_column)
                ),
                vec![self.key.clone()],
            )),
            EntityState::Unchanged | EntityState::Detached => None,
        }
    }

    /// Columns and values an INSERT of this entry writes. An unset
    /// store-generated key is left out.
    pub fn insert_row(&self) -> (Vec<&'static str>, Vec<Value>) {
        let omit_key = self.key_generated && self.key.is_unset_key();
        self.columns
            .iter()
            .zip(self.values.iter())
            .filter(|(c, _)| !(omit_key && **c == self.key_column))
            .map(|(c, v)| (*c, v.clone()))
            .unzip()
    }

    fn insert_statement(&self) -> Statement {
        let (columns, params) = self.insert_row();
        let columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

        if columns.is_empty() {
            return Statement::new(
                format!("INSERT INTO {} DEFAULT VALUES", quote_ident(self.table)),
                Vec::new(),
            );
        }

        Statement::new(
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(self.table),
                columns.join(", "),
                placeholders(columns.len())
            ),
            params,
        )
    }

    fn update_statement(&self) -> Option<Statement> {
        let (assignments, mut params): (Vec<_>, Vec<_>) = self
            .columns
            .iter()
            .zip(self.values.iter())
            .filter(|(c, _)| **c != self.key_column)
            .map(|(c, v)| (format!("{} = ?", quote_ident(c)), v.clone()))
            .unzip();

        // Key-only tables have nothing to update
        if assignments.is_empty() {
            return None;
        }
        params.push(self.key.clone());

        Some(Statement::new(
            format!(
                "UPDATE {} SET {} WHERE {} = ?",
                quote_ident(self.table),
                assignments.join(", "),
                quote_ident(self.key_column)
            ),
            params,
        ))
    }
}

/// In-memory queue of pending changes for one persistence context.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: Vec<Option<Entry>>,
    index: HashMap<(&'static str, Value), usize>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an insert.
    pub fn add<T: Entity>(&mut self, entity: &T) -> CoreResult<EntityState> {
        self.track(Entry::of(entity, EntityState::Added)?)
    }

    /// Queues an update.
    pub fn modify<T: Entity>(&mut self, entity: &T) -> CoreResult<EntityState> {
        self.track(Entry::of(entity, EntityState::Modified)?)
    }

    /// Queues a delete.
    pub fn remove<T: Entity>(&mut self, entity: &T) -> CoreResult<EntityState> {
        self.track(Entry::of(entity, EntityState::Deleted)?)
    }

    /// Applies `incoming` (whose state is the requested operation) and
    /// returns the resulting state.
    fn track(&mut self, mut incoming: Entry) -> CoreResult<EntityState> {
        let requested = incoming.state;

        if requested != EntityState::Added && incoming.identity().is_none() {
            return Err(CoreError::MissingKey {
                table: incoming.table,
                operation: if requested == EntityState::Deleted {
                    "delete"
                } else {
                    "update"
                },
            });
        }

        let Some(identity) = incoming.identity() else {
            self.entries.push(Some(incoming));
            return Ok(EntityState::Added);
        };

        let existing = self.index.get(&identity).copied();
        let Some(slot) = existing else {
            self.index.insert(identity, self.entries.len());
            self.entries.push(Some(incoming));
            return Ok(requested);
        };

        let current = self.entries[slot]
            .as_ref()
            .map_or(EntityState::Detached, |e| e.state);

        let next = match (current, requested) {
            (EntityState::Added | EntityState::Modified, EntityState::Added) => {
                return Err(CoreError::AlreadyTracked {
                    table: incoming.table,
                    key: incoming.key,
                });
            }
            (EntityState::Deleted, EntityState::Added) => EntityState::Modified,
            (EntityState::Added, EntityState::Modified) => EntityState::Added,
            (_, EntityState::Modified) => EntityState::Modified,
            (EntityState::Added, EntityState::Deleted) => {
                self.entries[slot] = None;
                self.index.remove(&identity);
                return Ok(EntityState::Detached);
            }
            (_, state) => state,
        };

        incoming.state = next;
        self.entries[slot] = Some(incoming);
        Ok(next)
    }

    /// State of a keyed entity; `Detached` when not tracked.
    pub fn state_of(&self, table: &str, key: &Value) -> EntityState {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.table == table && &e.key == key)
            .map_or(EntityState::Detached, |e| e.state)
    }

    /// Pending entries, in queue order.
    pub fn pending(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.pending().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_changes(&self) -> bool {
        !self.is_empty()
    }

    /// Removes and returns every pending entry.
    pub fn drain(&mut self) -> Vec<Entry> {
        self.index.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .flatten()
            .collect()
    }

    /// Puts back entries taken by [`ChangeTracker::drain`] after a failed
    /// save. Anything queued in the meantime is replayed on top.
    ///
    /// ## Returns
    /// The replay conflicts. A newer entry that cannot merge with a restored
    /// one is dropped and the restored entry wins.
    pub fn restore(&mut self, entries: Vec<Entry>) -> Vec<CoreError> {
        let newer = self.drain();
        for entry in entries {
            if let Some(identity) = entry.identity() {
                self.index.insert(identity, self.entries.len());
            }
            self.entries.push(Some(entry));
        }
        newer
            .into_iter()
            .filter_map(|entry| self.track(entry).err())
            .collect()
    }

    /// Drops every pending entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Level {
        key: i64,
        name: String,
    }

    impl Entity for Level {
        const TABLE: &'static str = "level";
        const KEY: &'static str = "key";
        const KEY_GENERATED: bool = true;
        const COLUMNS: &'static [&'static str] = &["key", "name"];

        fn key(&self) -> Value {
            self.key.into()
        }

        fn values(&self) -> Vec<Value> {
            vec![self.key.into(), self.name.clone().into()]
        }
    }

    #[derive(Debug, Clone)]
    struct Broken;

    impl Entity for Broken {
        const TABLE: &'static str = "broken";
        const KEY: &'static str = "id";
        const COLUMNS: &'static [&'static str] = &["id", "name"];

        fn key(&self) -> Value {
            Value::Integer(1)
        }

        fn values(&self) -> Vec<Value> {
            vec![Value::Integer(1)]
        }
    }

    fn level(key: i64, name: &str) -> Level {
        Level {
            key,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_generated_inserts_are_not_merged() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&level(0, "a")).unwrap();
        tracker.add(&level(0, "b")).unwrap();
        assert_eq!(tracker.len(), 2);

        let stmt = tracker.pending().next().unwrap().statement().unwrap();
        assert_eq!(stmt.sql, r#"INSERT INTO "level" ("name") VALUES (?)"#);
        assert_eq!(stmt.params, vec![Value::from("a")]);
    }

    #[test]
    fn test_explicit_key_is_inserted() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&level(7, "a")).unwrap();

        let stmt = tracker.pending().next().unwrap().statement().unwrap();
        assert_eq!(stmt.sql, r#"INSERT INTO "level" ("key", "name") VALUES (?, ?)"#);
    }

    #[test]
    fn test_update_of_added_stays_added() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&level(7, "a")).unwrap();
        let state = tracker.modify(&level(7, "b")).unwrap();

        assert_eq!(state, EntityState::Added);
        assert_eq!(tracker.len(), 1);
        assert_eq!(
            tracker.pending().next().unwrap().values[1],
            Value::from("b")
        );
    }

    #[test]
    fn test_delete_of_added_detaches() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&level(7, "a")).unwrap();
        let state = tracker.remove(&level(7, "a")).unwrap();

        assert_eq!(state, EntityState::Detached);
        assert!(tracker.is_empty());
        assert_eq!(tracker.state_of("level", &Value::from(7)), EntityState::Detached);
    }

    #[test]
    fn test_delete_then_add_becomes_modified() {
        let mut tracker = ChangeTracker::new();
        tracker.remove(&level(3, "x")).unwrap();
        let state = tracker.add(&level(3, "y")).unwrap();

        assert_eq!(state, EntityState::Modified);
        let stmt = tracker.pending().next().unwrap().statement().unwrap();
        assert_eq!(stmt.sql, r#"UPDATE "level" SET "name" = ? WHERE "key" = ?"#);
        assert_eq!(stmt.params, vec![Value::from("y"), Value::from(3)]);
    }

    #[test]
    fn test_double_add_is_rejected() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&level(3, "x")).unwrap();
        let err = tracker.add(&level(3, "x")).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyTracked { .. }));
    }

    #[test]
    fn test_update_without_key_is_rejected() {
        let mut tracker = ChangeTracker::new();
        let err = tracker.modify(&level(0, "x")).unwrap_err();
        assert_eq!(
            err,
            CoreError::MissingKey {
                table: "level",
                operation: "update"
            }
        );
    }

    #[test]
    fn test_column_mismatch_is_rejected() {
        let mut tracker = ChangeTracker::new();
        let err = tracker.add(&Broken).unwrap_err();
        assert!(matches!(err, CoreError::ColumnMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_delete_statement() {
        let mut tracker = ChangeTracker::new();
        tracker.remove(&level(9, "")).unwrap();

        assert_eq!(tracker.state_of("level", &Value::from(9)), EntityState::Deleted);
        let stmt = tracker.pending().next().unwrap().statement().unwrap();
        assert_eq!(stmt.sql, r#"DELETE FROM "level" WHERE "key" = ?"#);
        assert_eq!(stmt.params, vec![Value::from(9)]);
    }

    #[test]
    fn test_restore_keeps_order_and_replays_newer() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&level(1, "a")).unwrap();
        tracker.add(&level(2, "b")).unwrap();

        let drained = tracker.drain();
        assert!(tracker.is_empty());

        // queued while the save was in flight
        tracker.modify(&level(2, "b2")).unwrap();
        tracker.add(&level(3, "c")).unwrap();

        assert!(tracker.restore(drained).is_empty());
        let keys: Vec<_> = tracker.pending().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(tracker.state_of("level", &Value::from(2)), EntityState::Added);
    }

    #[test]
    fn test_restore_reports_replay_conflicts() {
        let mut tracker = ChangeTracker::new();
        tracker.add(&level(1, "a")).unwrap();
        let drained = tracker.drain();

        // same key inserted again while the save was in flight
        tracker.add(&level(1, "again")).unwrap();
        tracker.add(&level(2, "b")).unwrap();

        let conflicts = tracker.restore(drained);
        assert_eq!(conflicts.len(), 1);
        assert!(matches!(
            &conflicts[0],
            CoreError::AlreadyTracked { table: "level", key } if *key == Value::from(1)
        ));

        let pending: Vec<_> = tracker.pending().map(|e| e.values.clone()).collect();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0][1], Value::from("a"));
    }
}
