//! # Repository
//!
//! Per-entity facade over the shared persistence context.
//!
//! ## Tracked vs Direct Writes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  insert / update / delete / delete_by_key                              │
//! │       │   (no I/O, except delete_by_key without a key-only ctor)       │
//! │       ▼                                                                 │
//! │  ChangeTracker ──── UnitOfWork::save_changes ────► one transaction     │
//! │                                                                         │
//! │  bulk_insert                                                           │
//! │       │   (bypasses the tracker and the identity map)                  │
//! │       ▼                                                                 │
//! │  multi-row INSERT batches ───────────────────────► one transaction     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use keel_core::{batch_inserts, CoreResult, Entity, EntityState, Entry, Value};
use tracing::debug;

use crate::config::BulkOptions;
use crate::context::DbContext;
use crate::error::{DbError, DbResult};
use crate::query::QueryBuilder;
use crate::record::Record;

/// Repository for one entity type.
///
/// Obtained from [`crate::UnitOfWork::repository`]; every repository of a
/// unit of work shares its context, so one `save_changes` covers them all.
pub struct Repository<T> {
    context: Arc<DbContext>,
    bulk: BulkOptions,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("table", &T::TABLE)
            .field("bulk", &self.bulk)
            .finish()
    }
}

impl<T: Record> Repository<T> {
    pub(crate) fn new(context: Arc<DbContext>, bulk: BulkOptions) -> Self {
        Repository {
            context,
            bulk,
            _entity: PhantomData,
        }
    }

    /// A fresh query over `T`.
    pub fn query(&self) -> QueryBuilder<T> {
        QueryBuilder::new(Arc::clone(&self.context))
    }

    // =========================================================================
    // Tracked Mutations
    // =========================================================================

    /// Queues an insert.
    ///
    /// ## Returns
    /// * `Ok(EntityState)` - `Added`, or `Modified` when re-adding a deleted row
    /// * `Err(DbError::Tracking)` - The same key is already queued for insert or update
    pub fn insert(&self, entity: &T) -> DbResult<EntityState> {
        debug!(table = T::TABLE, key = %entity.key(), "Queueing insert");
        let state = self.context.with_tracking(|t| -> CoreResult<EntityState> {
            let state = t.changes.add(entity)?;
            t.remember(entity);
            Ok(state)
        })??;
        Ok(state)
    }

    /// Queues inserts in iteration order.
    pub fn insert_many<I>(&self, entities: I) -> DbResult<()>
    where
        I: IntoIterator,
        I::Item: Borrow<T>,
    {
        for entity in entities {
            self.insert(entity.borrow())?;
        }
        Ok(())
    }

    /// Queues an update of every column.
    pub fn update(&self, entity: &T) -> DbResult<EntityState> {
        debug!(table = T::TABLE, key = %entity.key(), "Queueing update");
        let state = self.context.with_tracking(|t| -> CoreResult<EntityState> {
            let state = t.changes.modify(entity)?;
            t.remember(entity);
            Ok(state)
        })??;
        Ok(state)
    }

    pub fn update_many<I>(&self, entities: I) -> DbResult<()>
    where
        I: IntoIterator,
        I::Item: Borrow<T>,
    {
        for entity in entities {
            self.update(entity.borrow())?;
        }
        Ok(())
    }

    /// Queues a delete. Deleting a not-yet-saved insert just drops it.
    pub fn delete(&self, entity: &T) -> DbResult<EntityState> {
        let key = entity.key();
        debug!(table = T::TABLE, key = %key, "Queueing delete");
        let state = self.context.with_tracking(|t| -> CoreResult<EntityState> {
            let state = t.changes.remove(entity)?;
            t.forget::<T>(&key);
            Ok(state)
        })??;
        Ok(state)
    }

    pub fn delete_many<I>(&self, entities: I) -> DbResult<()>
    where
        I: IntoIterator,
        I::Item: Borrow<T>,
    {
        for entity in entities {
            self.delete(entity.borrow())?;
        }
        Ok(())
    }

    /// Queues deletion of the row with primary key `key`.
    ///
    /// Types whose [`Entity::from_key`] builds a placeholder are deleted
    /// without a read. Otherwise the row is looked up first; a missing row
    /// queues nothing and is not an error.
    pub async fn delete_by_key(&self, key: impl Into<Value>) -> DbResult<()> {
        let key = key.into();

        if let Some(placeholder) = T::from_key(key.clone()) {
            debug!(table = T::TABLE, key = %key, "Deleting by key without fetch");
            self.delete(&placeholder)?;
            return Ok(());
        }

        debug!(table = T::TABLE, key = %key, "No key-only constructor, fetching before delete");
        if let Some(existing) = self.query().find_by(key).await? {
            self.delete(&existing)?;
        }
        Ok(())
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Inserts `entities` directly, in multi-row batches inside one
    /// transaction.
    ///
    /// Rows per statement is `bulk.batch_size`, lowered when needed to stay
    /// under SQLite's bound-parameter limit. Each batch must finish within
    /// `bulk.batch_timeout_ms`.
    ///
    /// ## Returns
    /// * `Ok(rows)` - Rows written
    /// * `Err(DbError::Timeout)` - A batch ran past its deadline; nothing is committed
    pub async fn bulk_insert(&self, entities: &[T]) -> DbResult<u64> {
        if entities.is_empty() {
            return Ok(0);
        }

        let entries = entities
            .iter()
            .map(|e| Entry::of(e, EntityState::Added))
            .collect::<Result<Vec<_>, _>>()?;
        let statements = batch_inserts(&entries, self.bulk.batch_size);

        debug!(
            table = T::TABLE,
            rows = entries.len(),
            batches = statements.len(),
            "Bulk inserting"
        );
        self.context
            .execute_batches(&statements, self.bulk.batch_timeout())
            .await
    }

    /// Not supported; always fails.
    pub async fn bulk_update(&self, _entities: &[T]) -> DbResult<u64> {
        Err(DbError::NotSupported(format!("bulk update of {}", T::TABLE)))
    }

    /// Not supported; always fails.
    pub async fn bulk_delete(&self, _entities: &[T]) -> DbResult<u64> {
        Err(DbError::NotSupported(format!("bulk delete of {}", T::TABLE)))
    }
}
