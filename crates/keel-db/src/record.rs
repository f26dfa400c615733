//! # Records
//!
//! An entity that sqlx can also decode from a row.

use keel_core::Entity;
use sqlx::sqlite::SqliteRow;
use sqlx::FromRow;

/// [`Entity`] metadata plus `sqlx::FromRow` decoding.
///
/// Implemented automatically; derive `sqlx::FromRow` (with `#[sqlx(skip)]`
/// on navigation fields) and implement `Entity` by hand.
pub trait Record: Entity + for<'r> FromRow<'r, SqliteRow> + Unpin {}

impl<T> Record for T where T: Entity + for<'r> FromRow<'r, SqliteRow> + Unpin {}
