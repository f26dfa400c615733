//! # keel-db: SQLite Persistence for keel
//!
//! Repositories, a fluent query builder and a unit of work over one
//! lazily opened SQLite connection per unit.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         keel Data Flow                                  │
//! │                                                                         │
//! │  Application code                                                      │
//! │       │  db.unit_of_work()                                              │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    keel-db (THIS CRATE)                         │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────────┐    ┌───────────────┐    ┌───────────────┐   │   │
//! │  │   │  UnitOfWork  │───►│ Repository<T> │───►│QueryBuilder<T>│   │   │
//! │  │   │ save_changes │    │ insert/update │    │ filter/include│   │   │
//! │  │   │ change_db    │    │ bulk_insert   │    │ to_list/count │   │   │
//! │  │   └──────┬───────┘    └───────┬───────┘    └───────┬───────┘   │   │
//! │  │          │                    │                    │           │   │
//! │  │          ▼                    ▼                    ▼           │   │
//! │  │   ┌─────────────────────────────────────────────────────────┐  │   │
//! │  │   │ DbContext: SqliteConnection + ChangeTracker + identities │  │   │
//! │  │   └─────────────────────────────────────────────────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SQLite  <Data Source>/<Database>.db  (WAL, foreign keys on)    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - `DbConfig` with TOML loading and env overrides
//! - [`connection`] - Connection string parsing and database switching
//! - [`context`] - The shared persistence context
//! - [`database`] - `Database<S>` factory for units of work
//! - [`include`] - Eager loading of navigation properties
//! - [`query`] - `QueryBuilder<T>`
//! - [`repository`] - `Repository<T>`
//! - [`schema`] - Schema bootstrap
//! - [`unit_of_work`] - `UnitOfWork<S>`
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keel_db::{col, Database, DbConfig};
//!
//! let db = Database::<OdsSchema>::new(DbConfig::load(None)?)?;
//! let uow = db.unit_of_work();
//!
//! let funds = uow.repository::<DimFund>()?;
//! funds.insert(&DimFund::new("Fund1", "AustralianSuper"))?;
//! uow.save_changes().await?;
//!
//! let found = funds
//!     .query()
//!     .filter(col("fund_name").like("Australian%"))
//!     .to_list()
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod connection;
pub mod context;
pub mod database;
pub mod error;
pub mod include;
pub mod query;
pub mod record;
pub mod repository;
pub mod schema;
pub mod unit_of_work;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{BulkOptions, DbConfig};
pub use connection::ConnectionString;
pub use context::{DbContext, Diagnostics, Stats};
pub use database::Database;
pub use error::{DbError, DbResult};
pub use include::{Include, Loader};
pub use query::QueryBuilder;
pub use record::Record;
pub use repository::Repository;
pub use schema::{NoSchema, Schema};
pub use unit_of_work::{DatabaseSwitch, UnitOfWork};

// Core types callers need alongside the database API
pub use keel_core::{col, Entity, EntityState, Filter, Relation, Sort, Value};
