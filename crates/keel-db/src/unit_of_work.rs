//! # Unit of Work
//!
//! Scopes one persistence context, hands out its repositories and commits
//! their queued changes together.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      UnitOfWork Lifecycle                               │
//! │                                                                         │
//! │  Database::unit_of_work() / UnitOfWork::new(&config)?                  │
//! │       │   (no connection yet)                                          │
//! │       ▼                                                                 │
//! │  repository::<T>()  ── cached per TypeId, same Arc every call          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  insert / update / delete ... (queued)   query ... (opens connection)  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  save_changes()            one transaction                             │
//! │  save_changes_with(peers)  one transaction per participant,            │
//! │                            committed only after every flush succeeds   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  dispose()  ── true once; afterwards every call → DbError::Disposed    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Multi-Context Saves
//! The commit across participants is sequential, not two-phase: if a commit
//! fails after earlier participants committed, those stay committed and the
//! error says which participant failed. Peers on SQLite must target
//! different database files, since one file only admits one writer.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use keel_core::{Statement, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BulkOptions, DbConfig};
use crate::connection::is_valid_database_name;
use crate::context::{save_together, DbContext};
use crate::error::{DbError, DbResult};
use crate::record::Record;
use crate::repository::Repository;
use crate::schema::{NoSchema, Schema, SchemaPlan};

// =============================================================================
// Database Switch Outcome
// =============================================================================

/// Result of [`UnitOfWork::change_database`].
///
/// Switching reports failure as a value; the cause is kept for logging.
#[derive(Debug)]
pub struct DatabaseSwitch {
    database: String,
    error: Option<DbError>,
}

impl DatabaseSwitch {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// The requested database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> DbResult<()> {
        match self.error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

// =============================================================================
// Unit of Work
// =============================================================================

/// A scoped persistence context over schema `S`.
pub struct UnitOfWork<S: Schema = NoSchema> {
    id: Uuid,
    context: Arc<DbContext>,
    bulk: BulkOptions,
    repositories: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    _schema: PhantomData<fn() -> S>,
}

impl<S: Schema> fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("schema", &S::NAME)
            .field("context", &self.context)
            .finish()
    }
}

impl<S: Schema> UnitOfWork<S> {
    /// Creates a unit of work; the connection opens on first use.
    ///
    /// ## Returns
    /// * `Ok(UnitOfWork)` - Ready; no I/O has happened yet
    /// * `Err(DbError::InvalidConfig)` - `config` failed [`DbConfig::validate`]
    pub fn new(config: &DbConfig) -> DbResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    /// Creates a unit of work from a config already checked by
    /// [`DbConfig::validate`].
    pub(crate) fn from_validated(config: &DbConfig) -> Self {
        let id = Uuid::new_v4();
        debug!(uow_id = %id, schema = S::NAME, "Unit of work created");

        UnitOfWork {
            id,
            context: Arc::new(DbContext::new(config, SchemaPlan::of::<S>())),
            bulk: config.bulk,
            repositories: Mutex::new(HashMap::new()),
            _schema: PhantomData,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The persistence context shared by this unit's repositories.
    pub fn context(&self) -> &Arc<DbContext> {
        &self.context
    }

    pub fn has_changes(&self) -> DbResult<bool> {
        self.context.has_changes()
    }

    /// The repository for `T`, created on first request.
    ///
    /// ## Returns
    /// * `Ok(Arc<Repository<T>>)` - The same instance on every call
    /// * `Err(DbError::Disposed)` - The unit of work has been disposed
    pub fn repository<T: Record>(&self) -> DbResult<Arc<Repository<T>>> {
        self.context.check_live()?;

        let mut repositories = self
            .repositories
            .lock()
            .map_err(|_| DbError::Internal("repository cache lock poisoned".to_string()))?;

        let entry = repositories
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                debug!(uow_id = %self.id, table = T::TABLE, "Creating repository");
                let repository: Arc<dyn Any + Send + Sync> =
                    Arc::new(Repository::<T>::new(Arc::clone(&self.context), self.bulk));
                repository
            });

        Arc::clone(entry)
            .downcast::<Repository<T>>()
            .map_err(|_| DbError::Internal(format!("repository cache type mismatch for {}", T::TABLE)))
    }

    /// Commits every queued change in one transaction.
    ///
    /// ## Returns
    /// * `Ok(rows)` - Rows affected
    /// * `Err(DbError)` - The underlying failure; queued changes stay queued
    pub async fn save_changes(&self) -> DbResult<u64> {
        let rows = save_together(&[self.context.as_ref()]).await?;
        info!(uow_id = %self.id, rows, "Changes saved");
        Ok(rows)
    }

    /// Commits this unit's changes together with `peers`.
    ///
    /// A transaction is begun on every participant, each is flushed in turn,
    /// and all are committed only after every flush succeeded. Any failure
    /// rolls every participant back and is returned unchanged.
    pub async fn save_changes_with(&self, peers: &[&UnitOfWork<S>]) -> DbResult<u64> {
        let mut contexts: Vec<&DbContext> = Vec::with_capacity(peers.len() + 1);
        contexts.push(self.context.as_ref());

        for peer in peers {
            if contexts.iter().any(|c| std::ptr::eq(*c, peer.context.as_ref())) {
                return Err(DbError::invalid_argument(format!(
                    "unit of work {} appears more than once in the save",
                    peer.id
                )));
            }
            contexts.push(peer.context.as_ref());
        }

        let rows = save_together(&contexts).await?;
        info!(
            uow_id = %self.id,
            participants = contexts.len(),
            rows,
            "Changes saved across units of work"
        );
        Ok(rows)
    }

    /// Points the context at database `name`.
    ///
    /// ## Returns
    /// * `Err(DbError::InvalidArgument)` - `name` is empty or blank (no I/O attempted)
    /// * `Err(DbError::Disposed)` - The unit of work has been disposed
    /// * `Ok(DatabaseSwitch)` - Whether the switch succeeded, with the cause if not.
    ///   A name that is not a single word fails the switch without any I/O.
    pub async fn change_database(&self, name: &str) -> DbResult<DatabaseSwitch> {
        if name.trim().is_empty() {
            return Err(DbError::invalid_argument("database name must not be empty"));
        }
        self.context.check_live()?;

        let switched = if is_valid_database_name(name) {
            self.context.switch_database(name).await
        } else {
            Err(DbError::invalid_argument(format!(
                "database name '{}' must be a single word",
                name
            )))
        };

        let error = match switched {
            Ok(()) => {
                info!(uow_id = %self.id, database = name, "Switched database");
                None
            }
            Err(e) => {
                warn!(uow_id = %self.id, database = name, error = %e, "Database switch failed");
                Some(e)
            }
        };

        Ok(DatabaseSwitch {
            database: name.to_string(),
            error,
        })
    }

    /// Runs raw SQL with anonymous `?` parameters.
    ///
    /// ## Returns
    /// * `Ok(rows)` - Rows affected
    /// * `Err(DbError::InvalidArgument)` - `sql` is empty
    pub async fn execute_sql(&self, sql: &str, params: Vec<Value>) -> DbResult<u64> {
        if sql.trim().is_empty() {
            return Err(DbError::invalid_argument("sql must not be empty"));
        }

        debug!(uow_id = %self.id, sql, params = params.len(), "Executing raw SQL");
        self.context.execute_raw(&Statement::new(sql, params)).await
    }

    /// (total, applied) schema statements for the current database.
    pub async fn schema_status(&self) -> DbResult<(usize, usize)> {
        self.context.schema_status().await
    }

    /// Releases the context and cached repositories.
    ///
    /// Returns true only for the call that actually released them.
    pub async fn dispose(&self) -> bool {
        if !self.context.release().await {
            return false;
        }

        match self.repositories.lock() {
            Ok(mut repositories) => repositories.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        info!(uow_id = %self.id, "Unit of work disposed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use keel_core::col;

    fn ods() -> UnitOfWork<OdsSchema> {
        UnitOfWork::new(&DbConfig::in_memory("ods")).unwrap()
    }

    #[tokio::test]
    async fn test_repository_is_cached() {
        let uow = ods();
        let a = uow.repository::<DimFund>().unwrap();
        let b = uow.repository::<DimFund>().unwrap();
        let other = uow.repository::<DimEntity>().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        a.insert(&DimFund::new("Fund1", "AustralianSuper")).unwrap();
        other.insert(&DimEntity::new(1, "Sub Asset Class")).unwrap();

        // Both repositories share one context, so one save covers both
        assert_eq!(uow.save_changes().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_single_insert_in_snapshot_schema() {
        let uow =
            UnitOfWork::<SnapshotSchema>::new(&DbConfig::in_memory("snapshot")).unwrap();
        let repo = uow.repository::<ViewCountry>().unwrap();

        repo.insert(&ViewCountry::new("NZ", "New Zealand", "NZD")).unwrap();
        uow.save_changes().await.unwrap();

        assert_eq!(repo.query().count(None).await.unwrap(), 1);
        assert_eq!(uow.schema_status().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_relational_includes() {
        let uow = ods();
        let levels_repo = uow.repository::<AssetHierarchyLevel>().unwrap();
        let funds_repo = uow.repository::<DimFund>().unwrap();

        levels_repo.insert_many(levels()).unwrap();
        funds_repo.insert_many(funds()).unwrap();
        uow.repository::<DimEntity>().unwrap().insert_many(entities()).unwrap();
        uow.repository::<BridgeAssetHierarchy>()
            .unwrap()
            .insert_many(bridges())
            .unwrap();

        let rows = uow.save_changes().await.unwrap();
        assert_eq!(
            rows as usize,
            levels().len() + funds().len() + entities().len() + bridges().len()
        );

        let fund = funds_repo
            .query()
            .first_or_default(Some(col("fund_key").eq("Fund1")))
            .await
            .unwrap();
        assert!(fund.is_some());

        let by_key = || levels_repo.query().order_by("asset_hierarchy_level_key");

        // No include: navigation stays empty
        let level = by_key().first_or_default(None).await.unwrap().unwrap();
        assert!(level.bridges.is_empty());

        // One level: bridges loaded, their fund is not
        let level = by_key()
            .include(AssetHierarchyLevel::bridges())
            .first_or_default(None)
            .await
            .unwrap()
            .unwrap();
        assert!(!level.bridges.is_empty());
        assert!(level.bridges[0].fund.is_none());

        // Two levels: bridges and their fund
        let level = by_key()
            .include_with(
                crate::Include::new(AssetHierarchyLevel::bridges())
                    .then(BridgeAssetHierarchy::fund()),
            )
            .first_or_default(None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.bridges.len(), bridges().len());
        let fund = level.bridges[0].fund.as_ref().unwrap();
        assert_eq!(fund.fund_key, "Fund1");
    }

    #[tokio::test]
    async fn test_failed_save_keeps_changes_queued() {
        let uow = ods();
        let repo = uow.repository::<BridgeAssetHierarchy>().unwrap();

        // Level 1 does not exist, so the foreign key rejects the row
        repo.insert(&bridges()[0]).unwrap();
        let err = uow.save_changes().await.unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
        assert_eq!(uow.context().pending_count().unwrap(), 1);

        // Parents queued after the child still satisfy the deferred check
        uow.repository::<DimFund>()
            .unwrap()
            .insert(&DimFund::new("Fund1", "AustralianSuper"))
            .unwrap();
        uow.repository::<AssetHierarchyLevel>()
            .unwrap()
            .insert(&levels()[0])
            .unwrap();
        assert_eq!(uow.save_changes().await.unwrap(), 3);
        assert!(!uow.has_changes().unwrap());
        assert_eq!(repo.query().count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_with_peers_checks_foreign_keys_before_commit() {
        let ods = ods();
        let other = UnitOfWork::<OdsSchema>::new(&DbConfig::in_memory("ods_copy")).unwrap();

        ods.repository::<DimFund>().unwrap().insert_many(funds()).unwrap();
        // The peer has no level 1 or Fund1
        other
            .repository::<BridgeAssetHierarchy>()
            .unwrap()
            .insert(&bridges()[0])
            .unwrap();

        let err = ods.save_changes_with(&[&other]).await.unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { ref message }
            if message.contains("bridge_asset_hierarchy")));

        assert_eq!(
            ods.repository::<DimFund>().unwrap().query().count(None).await.unwrap(),
            0
        );
        assert_eq!(ods.context().pending_count().unwrap(), 2);
        assert_eq!(other.context().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_with_peers_commits_all() {
        let ods = ods();
        let other = UnitOfWork::<OdsSchema>::new(&DbConfig::in_memory("ods_copy")).unwrap();

        ods.repository::<DimFund>().unwrap().insert_many(funds()).unwrap();
        other
            .repository::<DimFund>()
            .unwrap()
            .insert(&DimFund::new("Fund2", "Other"))
            .unwrap();

        assert_eq!(ods.save_changes_with(&[&other]).await.unwrap(), 3);
        assert!(!ods.has_changes().unwrap());
        assert!(!other.has_changes().unwrap());
        assert_eq!(
            other.repository::<DimFund>().unwrap().query().count(None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_save_with_peers_rolls_back_all() {
        let ods = ods();
        let other = UnitOfWork::<OdsSchema>::new(&DbConfig::in_memory("ods_copy")).unwrap();
        let peer_funds = other.repository::<DimFund>().unwrap();

        peer_funds.insert(&DimFund::new("Fund1", "AustralianSuper")).unwrap();
        other.save_changes().await.unwrap();

        ods.repository::<DimFund>().unwrap().insert_many(funds()).unwrap();
        // Already stored in the peer's database
        peer_funds.insert(&DimFund::new("Fund1", "Again")).unwrap();

        let err = ods.save_changes_with(&[&other]).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));

        // Nothing committed anywhere; everything still queued
        assert_eq!(
            ods.repository::<DimFund>().unwrap().query().count(None).await.unwrap(),
            0
        );
        let kept = peer_funds.query().first_or_default(None).await.unwrap().unwrap();
        assert_eq!(kept.fund_name, "AustralianSuper");
        assert!(ods.has_changes().unwrap());
        assert_eq!(other.context().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_self_as_peer_is_rejected() {
        let uow = ods();
        let err = uow.save_changes_with(&[&uow]).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_change_database_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbConfig::new(format!(
            "Data Source={};Database=first;",
            dir.path().display()
        ));
        let uow = UnitOfWork::<OdsSchema>::new(&config).unwrap();
        let funds_repo = uow.repository::<DimFund>().unwrap();

        funds_repo.insert(&DimFund::new("Fund1", "AustralianSuper")).unwrap();
        uow.save_changes().await.unwrap();

        let same = uow.change_database("first").await.unwrap();
        assert!(same.succeeded());

        let switch = uow.change_database("second").await.unwrap();
        assert!(switch.succeeded(), "{:?}", switch.error());
        assert_eq!(uow.context().database().await.as_deref(), Some("second"));
        assert_eq!(funds_repo.query().count(None).await.unwrap(), 0);
        assert!(dir.path().join("second.db").exists());

        assert!(uow.change_database("first").await.unwrap().succeeded());
        assert_eq!(funds_repo.query().count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_change_database_on_closed_context() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbConfig::new(format!(
            "Data Source={};Database=first;",
            dir.path().display()
        ));
        let uow = UnitOfWork::<OdsSchema>::new(&config).unwrap();
        assert!(!uow.context().is_open().await);

        assert!(uow.change_database("elsewhere").await.unwrap().succeeded());
        assert!(uow.context().is_open().await);
        assert!(dir.path().join("elsewhere.db").exists());
        assert!(!dir.path().join("first.db").exists());
    }

    #[tokio::test]
    async fn test_change_database_without_segment_reports_failure() {
        let uow =
            UnitOfWork::<OdsSchema>::new(&DbConfig::new("Data Source=:memory:")).unwrap();

        let switch = uow.change_database("other").await.unwrap();
        assert!(!switch.succeeded());
        assert_eq!(switch.database(), "other");
        assert!(matches!(switch.error(), Some(DbError::InvalidConfig(_))));
        assert!(switch.into_result().is_err());
    }

    #[tokio::test]
    async fn test_change_database_rejects_bad_names() {
        let uow = ods();
        assert!(matches!(
            uow.change_database("").await,
            Err(DbError::InvalidArgument(_))
        ));
        assert!(matches!(
            uow.change_database("  ").await,
            Err(DbError::InvalidArgument(_))
        ));

        let switch = uow.change_database("no;pe").await.unwrap();
        assert!(!switch.succeeded());
        assert_eq!(switch.database(), "no;pe");
        assert!(matches!(switch.error(), Some(DbError::InvalidArgument(_))));
        assert!(!uow.context().is_open().await);
    }

    #[tokio::test]
    async fn test_execute_sql() {
        let uow = ods();
        assert!(matches!(
            uow.execute_sql("  ", vec![]).await,
            Err(DbError::InvalidArgument(_))
        ));

        let rows = uow
            .execute_sql(
                "INSERT INTO dim_fund (fund_key, fund_name) VALUES (?, ?)",
                vec![Value::from("Fund1"), Value::from("AustralianSuper")],
            )
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(
            uow.repository::<DimFund>().unwrap().query().count(None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let uow = ods();
        let repo = uow.repository::<DimFund>().unwrap();
        repo.insert(&DimFund::new("Fund1", "AustralianSuper")).unwrap();

        assert!(uow.dispose().await);
        assert!(!uow.dispose().await);

        assert!(matches!(uow.repository::<DimFund>(), Err(DbError::Disposed)));
        assert!(matches!(repo.query().count(None).await, Err(DbError::Disposed)));
        assert!(matches!(uow.save_changes().await, Err(DbError::Disposed)));
        assert!(matches!(
            uow.execute_sql("SELECT 1", vec![]).await,
            Err(DbError::Disposed)
        ));
    }
}
