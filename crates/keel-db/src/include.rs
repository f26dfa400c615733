//! # Eager Loading
//!
//! Include trees for [`crate::QueryBuilder`].
//!
//! ## Query Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  levels.include_with(Include::new(bridges()).then(fund()))              │
//! │                                                                         │
//! │  1. SELECT * FROM asset_hierarchy_level ...            (the query)      │
//! │  2. SELECT * FROM bridge_asset_hierarchy                                │
//! │       WHERE asset_hierarchy_level_key IN (?, ?, ...)   (one per level)  │
//! │  3. SELECT * FROM dim_fund WHERE fund_key IN (?, ...)  (one per level)  │
//! │                                                                         │
//! │  Deepest level loads first, then results are attached upwards.          │
//! │  No parents (or no non-NULL keys) → no query for that level.            │
//! │  More than 32766 keys → one IN query per chunk of keys.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{col, Entity, QuerySpec, Relation, Sort, MAX_BIND_PARAMETERS};
use sqlx::sqlite::SqliteConnection;
use tracing::debug;

use crate::context::{fetch_all, Stats};
use crate::error::DbResult;
use crate::record::Record;

/// Loads related rows for a batch of parents of type `P`.
#[async_trait]
pub trait Loader<P>: Send + Sync {
    /// Dotted navigation path, e.g. `bridges.fund`.
    fn paths(&self) -> Vec<String>;

    async fn load(
        &self,
        conn: &mut SqliteConnection,
        stats: &Stats,
        parents: &mut [P],
    ) -> DbResult<()>;
}

/// One navigation plus the navigations to load beneath it.
pub struct Include<P, C> {
    relation: Relation<P, C>,
    nested: Vec<Arc<dyn Loader<C>>>,
}

impl<P, C> Clone for Include<P, C> {
    fn clone(&self) -> Self {
        Include {
            relation: self.relation,
            nested: self.nested.clone(),
        }
    }
}

impl<P: Entity, C: Record> Include<P, C> {
    pub fn new(relation: Relation<P, C>) -> Self {
        Include {
            relation,
            nested: Vec::new(),
        }
    }

    /// Also loads `relation` on each loaded child.
    pub fn then<G: Record>(self, relation: Relation<C, G>) -> Self {
        self.then_include(Include::new(relation))
    }

    /// Also loads a whole include tree on each loaded child.
    pub fn then_include<G: Record>(mut self, include: Include<C, G>) -> Self {
        self.nested.push(Arc::new(include));
        self
    }
}

#[async_trait]
impl<P: Entity, C: Record> Loader<P> for Include<P, C> {
    fn paths(&self) -> Vec<String> {
        let name = self.relation.name();
        let mut paths = vec![name.to_string()];
        for nested in &self.nested {
            paths.extend(
                nested
                    .paths()
                    .into_iter()
                    .map(|p| format!("{}.{}", name, p)),
            );
        }
        paths
    }

    async fn load(
        &self,
        conn: &mut SqliteConnection,
        stats: &Stats,
        parents: &mut [P],
    ) -> DbResult<()> {
        let lookup = self.relation.lookup_values(parents);

        // Each IN list stays under SQLite's bound-parameter limit
        let mut children: Vec<C> = Vec::new();
        for chunk in lookup.chunks(MAX_BIND_PARAMETERS) {
            let mut spec = QuerySpec::table(C::TABLE);
            spec.filter(col(self.relation.foreign_column()).is_in(chunk.to_vec()));
            spec.order(Sort::asc(C::KEY));
            children.extend(fetch_all::<C>(&mut *conn, &spec.render(), stats).await?);
        }

        debug!(
            relation = self.relation.name(),
            table = C::TABLE,
            rows = children.len(),
            "Loaded related rows"
        );

        for nested in &self.nested {
            nested.load(&mut *conn, stats, &mut children).await?;
        }

        self.relation.attach(parents, &children);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use crate::{DbConfig, UnitOfWork};

    #[tokio::test]
    async fn test_include_over_more_parents_than_bind_limit() {
        let uow = UnitOfWork::<OdsSchema>::new(&DbConfig::in_memory("ods")).unwrap();
        let levels_repo = uow.repository::<AssetHierarchyLevel>().unwrap();

        let total = MAX_BIND_PARAMETERS + 234;
        let many: Vec<AssetHierarchyLevel> = (1..=total as i64)
            .map(|n| AssetHierarchyLevel::new(format!("AssetHierarchyLevel {}", n), n))
            .collect();
        levels_repo.bulk_insert(&many).await.unwrap();

        uow.repository::<DimFund>().unwrap().insert_many(funds()).unwrap();
        let mut last = bridges()[0].clone();
        last.asset_hierarchy_level_key = total as i64;
        let bridge_repo = uow.repository::<BridgeAssetHierarchy>().unwrap();
        bridge_repo.insert_many(bridges()).unwrap();
        bridge_repo.insert(&last).unwrap();
        uow.save_changes().await.unwrap();

        let reads = uow.context().diagnostics().reads;
        let loaded = levels_repo
            .query()
            .order_by("asset_hierarchy_level_key")
            .include(AssetHierarchyLevel::bridges())
            .to_list()
            .await
            .unwrap();

        // The parent query plus one child query per chunk of keys
        assert_eq!(uow.context().diagnostics().reads, reads + 3);
        assert_eq!(loaded.len(), total);
        assert_eq!(loaded[0].bridges.len(), bridges().len());
        assert_eq!(loaded[total - 1].bridges.len(), 1);
        assert!(loaded[1].bridges.is_empty());
    }

    #[test]
    fn test_paths_nest_with_dots() {
        let include = Include::new(AssetHierarchyLevel::bridges()).then(BridgeAssetHierarchy::fund());
        assert_eq!(include.paths(), vec!["bridges".to_string(), "bridges.fund".to_string()]);
    }
}
