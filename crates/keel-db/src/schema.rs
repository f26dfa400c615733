//! # Schema Bootstrap
//!
//! Ordered DDL applied when a context first opens its connection.
//!
//! ## How Bootstrap Works
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Schema Bootstrap                                   │
//! │                                                                         │
//! │  Context opens connection                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Schema has no statements? ── yes ──► done (nothing recorded)          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Statement N becomes migration version N                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  sqlx Migrator compares against _sqlx_migrations                       │
//! │       │                                                                 │
//! │       ├── version 1 ✓ (already applied)                                │
//! │       ├── version 2 ✓ (already applied)                                │
//! │       └── version 3 ⬜ (NEW - runs in its own transaction)              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adding Statements
//! Append to the end of `STATEMENTS`. Never edit or reorder applied ones:
//! versions are positions in the list and each is checksummed.
//! One schema per database file.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;

use sqlx::error::BoxDynError;
use sqlx::migrate::{Migration, MigrationSource, MigrationType, Migrator};
use sqlx::sqlite::SqliteConnection;
use tracing::info;

use crate::error::{DbError, DbResult};

/// The set of tables a unit of work is bound to.
///
/// Each implementor is a zero-sized marker type; `UnitOfWork<S>` is generic
/// over it, so two units of work over different schemas cannot be mixed.
pub trait Schema: Send + Sync + 'static {
    /// Name used in migration descriptions and logs.
    const NAME: &'static str;

    /// DDL statements in application order.
    const STATEMENTS: &'static [&'static str];
}

/// A schema with no tables; bootstrap is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchema;

impl Schema for NoSchema {
    const NAME: &'static str = "none";
    const STATEMENTS: &'static [&'static str] = &[];
}

/// A schema captured as plain data, so the context stays non-generic.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchemaPlan {
    pub(crate) name: &'static str,
    pub(crate) statements: &'static [&'static str],
}

impl SchemaPlan {
    pub(crate) fn of<S: Schema>() -> Self {
        SchemaPlan {
            name: S::NAME,
            statements: S::STATEMENTS,
        }
    }
}

impl<'s> MigrationSource<'s> for SchemaPlan {
    fn resolve(
        self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Migration>, BoxDynError>> + Send + 's>> {
        Box::pin(async move {
            Ok(self
                .statements
                .iter()
                .enumerate()
                .map(|(index, statement)| {
                    let version = index as i64 + 1;
                    Migration::new(
                        version,
                        Cow::Owned(format!("{} v{}", self.name, version)),
                        MigrationType::Simple,
                        Cow::Borrowed(*statement),
                        false,
                    )
                })
                .collect())
        })
    }
}

/// Applied versions recorded by the migrator; 0 before the first run.
async fn applied_count(conn: &mut SqliteConnection) -> DbResult<usize> {
    let tracked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(&mut *conn)
    .await?;
    if tracked == 0 {
        return Ok(0);
    }

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(&mut *conn)
        .await?;
    Ok(usize::try_from(applied).unwrap_or(0))
}

/// Applies every statement of `plan` not yet recorded.
///
/// ## Returns
/// * `Ok(n)` - Number of statements applied by this call (0 when current)
/// * `Err(DbError::MigrationFailed)` - A statement failed; it and later
///   statements are not recorded
pub(crate) async fn ensure(conn: &mut SqliteConnection, plan: &SchemaPlan) -> DbResult<usize> {
    if plan.statements.is_empty() {
        return Ok(0);
    }

    let before = applied_count(conn).await?;
    if before >= plan.statements.len() {
        return Ok(0);
    }

    info!(
        schema = plan.name,
        applied = before,
        total = plan.statements.len(),
        "Applying pending schema statements"
    );

    let migrator = Migrator::new(*plan).await?;
    migrator
        .run(&mut *conn)
        .await
        .map_err(|e| DbError::MigrationFailed(format!("{}: {}", plan.name, e)))?;

    let after = applied_count(conn).await?;
    info!(schema = plan.name, "Schema is current");
    Ok(after.saturating_sub(before))
}

/// Returns (total statements, applied statements).
pub(crate) async fn status(conn: &mut SqliteConnection, plan: &SchemaPlan) -> DbResult<(usize, usize)> {
    if plan.statements.is_empty() {
        return Ok((0, 0));
    }
    let applied = applied_count(conn).await?;
    Ok((plan.statements.len(), applied.min(plan.statements.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::ConnectOptions;
    use std::str::FromStr;

    struct Tiny;

    impl Schema for Tiny {
        const NAME: &'static str = "tiny";
        const STATEMENTS: &'static [&'static str] = &[
            "CREATE TABLE a (id INTEGER PRIMARY KEY)",
            "CREATE TABLE b (id INTEGER PRIMARY KEY)",
        ];
    }

    async fn memory() -> SqliteConnection {
        sqlx::sqlite::SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let mut conn = memory().await;
        let plan = SchemaPlan::of::<Tiny>();

        assert_eq!(status(&mut conn, &plan).await.unwrap(), (2, 0));
        assert_eq!(ensure(&mut conn, &plan).await.unwrap(), 2);
        assert_eq!(ensure(&mut conn, &plan).await.unwrap(), 0);
        assert_eq!(status(&mut conn, &plan).await.unwrap(), (2, 2));
    }

    #[tokio::test]
    async fn test_empty_schema_records_nothing() {
        let mut conn = memory().await;
        let plan = SchemaPlan::of::<NoSchema>();

        assert_eq!(ensure(&mut conn, &plan).await.unwrap(), 0);
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = '_sqlx_migrations'",
        )
        .fetch_one(&mut conn)
        .await
        .unwrap();
        assert_eq!(tables, 0);
    }

    #[tokio::test]
    async fn test_statements_are_recorded_as_migrations() {
        let mut conn = memory().await;
        ensure(&mut conn, &SchemaPlan::of::<Tiny>()).await.unwrap();

        let recorded: Vec<(i64, String)> =
            sqlx::query_as("SELECT version, description FROM _sqlx_migrations ORDER BY version")
                .fetch_all(&mut conn)
                .await
                .unwrap();
        assert_eq!(
            recorded,
            vec![(1, "tiny v1".to_string()), (2, "tiny v2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_statement_is_not_recorded() {
        struct Broken;
        impl Schema for Broken {
            const NAME: &'static str = "broken";
            const STATEMENTS: &'static [&'static str] =
                &["CREATE TABLE ok (id INTEGER)", "CREATE TABLE nope ("];
        }

        let mut conn = memory().await;
        let plan = SchemaPlan::of::<Broken>();
        let err = ensure(&mut conn, &plan).await.unwrap_err();
        assert!(matches!(err, DbError::MigrationFailed(ref m) if m.starts_with("broken")));
        // Each statement commits on its own
        assert_eq!(status(&mut conn, &plan).await.unwrap(), (2, 1));
    }
}
