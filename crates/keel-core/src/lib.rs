//! # keel-core: Pure Data-Access Building Blocks
//!
//! Everything the persistence layer needs that does not touch a database:
//! entity metadata, bindable values, query composition and change tracking.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          keel Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  keel-db: UnitOfWork ─► Repository<T> ─► QueryBuilder<T>        │   │
//! │  │           DbContext (SqliteConnection + tracker + identity map) │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ keel-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────────┐   │   │
//! │  │   │  entity  │  │  value   │  │  query   │  │   tracker    │   │   │
//! │  │   │  Entity  │  │  Value   │  │ QuerySpec│  │ ChangeTracker│   │   │
//! │  │   │  State   │  │          │  │  Filter  │  │    Entry     │   │   │
//! │  │   └──────────┘  └──────────┘  └──────────┘  └──────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • DETERMINISTIC SQL RENDERING            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`entity`] - The `Entity` mapping trait and `EntityState`
//! - [`value`] - Bindable SQL values
//! - [`query`] - Filters, ordering and `QuerySpec` rendering
//! - [`relation`] - Navigation descriptors for eager loading
//! - [`tracker`] - Pending-change queue
//! - [`batch`] - Multi-row INSERT batching for bulk writes
//! - [`error`] - Core error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod batch;
pub mod entity;
pub mod error;
pub mod query;
pub mod relation;
pub mod tracker;
pub mod value;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use batch::{batch_inserts, MAX_BIND_PARAMETERS};
pub use entity::{Entity, EntityState};
pub use error::{CoreError, CoreResult};
pub use query::{col, Filter, QuerySpec, Sort, Statement};
pub use relation::Relation;
pub use tracker::{ChangeTracker, Entry};
pub use value::Value;
