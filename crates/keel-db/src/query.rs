//! # Query Builder
//!
//! Composable, non-tracking reads over one entity type.
//!
//! ## Composition
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  repo.query()                     fresh QuerySpec over T::TABLE        │
//! │      .filter(col("level").gt(1))  AND-ed with earlier filters          │
//! │      .order_by_desc("level")      replaces earlier ordering            │
//! │      .skip(10).take(5)            replaces earlier paging              │
//! │      .filter(...)                 after paging: applies to the page    │
//! │      .include(Level::bridges())   eager load on the results            │
//! │      .to_list().await?            one SELECT + one per include level   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every builder owns its own state, so concurrent builders over the same
//! repository never see each other's filters. Only [`QueryBuilder::find_by`]
//! touches the identity map.

use std::fmt;
use std::sync::Arc;

use keel_core::{col, Filter, QuerySpec, Relation, Sort, Statement, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::FromRow;
use tracing::debug;

use crate::context::{fetch_all, fetch_count, fetch_scalars, DbContext};
use crate::error::DbResult;
use crate::include::{Include, Loader};
use crate::record::Record;

/// A query over `T` bound to a persistence context.
pub struct QueryBuilder<T> {
    context: Arc<DbContext>,
    spec: QuerySpec,
    includes: Vec<Arc<dyn Loader<T>>>,
}

impl<T> Clone for QueryBuilder<T> {
    fn clone(&self) -> Self {
        QueryBuilder {
            context: Arc::clone(&self.context),
            spec: self.spec.clone(),
            includes: self.includes.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let includes: Vec<String> = self.includes.iter().flat_map(|i| i.paths()).collect();
        f.debug_struct("QueryBuilder")
            .field("spec", &self.spec)
            .field("includes", &includes)
            .finish()
    }
}

impl<T: Record> QueryBuilder<T> {
    pub(crate) fn new(context: Arc<DbContext>) -> Self {
        QueryBuilder {
            context,
            spec: QuerySpec::table(T::TABLE),
            includes: Vec::new(),
        }
    }

    // =========================================================================
    // Composition
    // =========================================================================

    /// Adds a predicate, AND-ed with earlier ones.
    pub fn filter(mut self, predicate: Filter) -> Self {
        self.spec.filter(predicate);
        self
    }

    /// Orders ascending by `column`, replacing earlier ordering.
    pub fn order_by(self, column: &str) -> Self {
        self.order_by_with(Sort::asc(column))
    }

    /// Orders descending by `column`, replacing earlier ordering.
    pub fn order_by_desc(self, column: &str) -> Self {
        self.order_by_with(Sort::desc(column))
    }

    /// Orders by a multi-column sort, replacing earlier ordering.
    ///
    /// ## Example
    /// ```rust,ignore
    /// repo.query().order_by_with(Sort::asc("level").then_desc("name"));
    /// ```
    pub fn order_by_with(mut self, sort: Sort) -> Self {
        self.spec.order(sort);
        self
    }

    pub fn skip(mut self, count: u64) -> Self {
        self.spec.skip(count);
        self
    }

    pub fn take(mut self, count: u64) -> Self {
        self.spec.take(count);
        self
    }

    /// Eager-loads one navigation.
    pub fn include<C: Record>(self, relation: Relation<T, C>) -> Self {
        self.include_with(Include::new(relation))
    }

    /// Eager-loads a navigation tree built with [`Include::then`].
    pub fn include_with<C: Record>(mut self, include: Include<T, C>) -> Self {
        self.includes.push(Arc::new(include));
        self
    }

    /// Replaces the source with raw SQL and drops all composed state.
    ///
    /// Placeholders are anonymous `?`, bound in order from `params`.
    /// Further filters, ordering and paging compose over the raw rows.
    pub fn from_sql(mut self, sql: impl Into<String>, params: Vec<Value>) -> Self {
        self.spec = QuerySpec::raw(sql, params);
        self.includes.clear();
        self
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// The composed query, for inspection or reuse.
    pub fn as_query(&self) -> &QuerySpec {
        &self.spec
    }

    /// The SQL `to_list` would run.
    pub fn to_sql(&self) -> Statement {
        self.spec.render()
    }

    /// Dotted paths of every requested include.
    pub fn include_paths(&self) -> Vec<String> {
        self.includes.iter().flat_map(|i| i.paths()).collect()
    }

    // =========================================================================
    // Terminal Operations
    // =========================================================================

    /// Materializes every matching row, with includes loaded.
    pub async fn to_list(&self) -> DbResult<Vec<T>> {
        self.load(&self.spec).await
    }

    /// Number of matching rows; `predicate` applies after paging.
    pub async fn count(&self, predicate: Option<Filter>) -> DbResult<i64> {
        let stmt = self.spec.narrowed(predicate).render_count();
        debug!(table = T::TABLE, sql = %stmt.sql, "Counting rows");

        let mut session = self.context.session().await?;
        let conn = session.connection().await?;
        fetch_count(conn, &stmt, self.context.stats()).await
    }

    /// First matching row, or `None`; `predicate` applies after paging.
    pub async fn first_or_default(&self, predicate: Option<Filter>) -> DbResult<Option<T>> {
        let spec = self.spec.narrowed(predicate).first();
        Ok(self.load(&spec).await?.into_iter().next())
    }

    /// The row with primary key `key`, ignoring composed filters.
    ///
    /// ## Lookup Order
    /// 1. Queued for deletion in this context → `None`
    /// 2. Identity map hit → the tracked instance, no round trip
    /// 3. Database → the row is remembered for later lookups and mutations
    pub async fn find_by(&self, key: impl Into<Value>) -> DbResult<Option<T>> {
        let key = key.into();

        let (deleted, cached) = self.context.with_tracking(|t| {
            let deleted = t.changes.state_of(T::TABLE, &key) == keel_core::EntityState::Deleted;
            (deleted, t.identity::<T>(&key))
        })?;
        if deleted {
            return Ok(None);
        }
        if let Some(entity) = cached {
            debug!(table = T::TABLE, key = %key, "Identity map hit");
            return Ok(Some(entity));
        }

        let mut spec = QuerySpec::table(T::TABLE);
        spec.filter(col(T::KEY).eq(key.clone()));
        spec.take(1);
        let stmt = spec.render();
        debug!(table = T::TABLE, key = %key, "Finding by key");

        let found: Option<T> = {
            let mut session = self.context.session().await?;
            let conn = session.connection().await?;
            fetch_all::<T>(conn, &stmt, self.context.stats())
                .await?
                .into_iter()
                .next()
        };

        if let Some(entity) = &found {
            self.context.with_tracking(|t| t.remember(entity))?;
        }
        Ok(found)
    }

    /// Projects the composed query into `R`, decoding only `columns`.
    pub async fn select<R>(&self, columns: &[&str]) -> DbResult<Vec<R>>
    where
        R: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let stmt = self.spec.render_columns(columns);
        debug!(table = T::TABLE, sql = %stmt.sql, "Running projection");

        let mut session = self.context.session().await?;
        let conn = session.connection().await?;
        fetch_all::<R>(conn, &stmt, self.context.stats()).await
    }

    /// Projects one column of the composed query.
    pub async fn pluck<V>(&self, column: &str) -> DbResult<Vec<V>>
    where
        V: Send + Unpin,
        (V,): for<'r> FromRow<'r, SqliteRow>,
    {
        let stmt = self.spec.render_columns(&[column]);

        let mut session = self.context.session().await?;
        let conn = session.connection().await?;
        fetch_scalars::<V>(conn, &stmt, self.context.stats()).await
    }

    async fn load(&self, spec: &QuerySpec) -> DbResult<Vec<T>> {
        let stmt = spec.render();
        debug!(table = T::TABLE, sql = %stmt.sql, "Running query");

        let mut session = self.context.session().await?;
        let conn = session.connection().await?;
        let stats = self.context.stats();

        let mut rows = fetch_all::<T>(&mut *conn, &stmt, stats).await?;
        for include in &self.includes {
            include.load(&mut *conn, stats, &mut rows).await?;
        }

        debug!(table = T::TABLE, rows = rows.len(), "Query returned rows");
        Ok(rows)
    }
}
