//! # Insert Batching
//!
//! Groups Added entries into multi-row `INSERT ... VALUES (..), (..)`
//! statements for bulk writes.
//!
//! ```text
//! rows per statement = min(batch_size, MAX_BIND_PARAMETERS / columns)
//! ```
//!
//! Consecutive entries share a statement only when they write the same
//! column list, so rows with an explicit key and rows with a generated key
//! never mix.

use crate::query::{placeholders, quote_ident, Statement};
use crate::tracker::Entry;
use crate::value::Value;

/// SQLite's default `SQLITE_MAX_VARIABLE_NUMBER` (3.32+).
pub const MAX_BIND_PARAMETERS: usize = 32_766;

/// Renders `entries` as multi-row INSERT statements, in input order.
///
/// ## Arguments
/// * `entries` - Added entries, typically of one table
/// * `batch_size` - Upper bound on rows per statement (0 is treated as 1)
pub fn batch_inserts(entries: &[Entry], batch_size: usize) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut current: Option<Batch> = None;

    for entry in entries {
        let (columns, values) = entry.insert_row();
        let fits = current.as_ref().is_some_and(|b| {
            b.table == entry.table && b.columns == columns && b.rows < b.capacity
        });

        if !fits {
            if let Some(done) = current.take() {
                statements.push(done.finish());
            }
            current = Some(Batch::new(entry.table, columns, batch_size));
        }

        if let Some(batch) = current.as_mut() {
            batch.push(values);
        }
    }

    if let Some(done) = current {
        statements.push(done.finish());
    }
    statements
}

struct Batch {
    table: &'static str,
    columns: Vec<&'static str>,
    capacity: usize,
    rows: usize,
    params: Vec<Value>,
}

impl Batch {
    fn new(table: &'static str, columns: Vec<&'static str>, batch_size: usize) -> Self {
        let by_parameters = MAX_BIND_PARAMETERS / columns.len().max(1);
        // DEFAULT VALUES takes no row list, so those go one per statement
        let capacity = if columns.is_empty() {
            1
        } else {
            batch_size.max(1).min(by_parameters)
        };

        Batch {
            table,
            columns,
            capacity,
            rows: 0,
            params: Vec::new(),
        }
    }

    fn push(&mut self, values: Vec<Value>) {
        self.rows += 1;
        self.params.extend(values);
    }

    fn finish(self) -> Statement {
        if self.columns.is_empty() {
            return Statement::new(
                format!("INSERT INTO {} DEFAULT VALUES", quote_ident(self.table)),
                Vec::new(),
            );
        }

        let row = format!("({})", placeholders(self.columns.len()));
        let rows = vec![row; self.rows].join(", ");
        let columns = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        Statement::new(
            format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(self.table),
                columns,
                rows
            ),
            self.params,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityState};

    #[derive(Debug, Clone)]
    struct Row {
        id: i64,
        name: &'static str,
    }

    impl Entity for Row {
        const TABLE: &'static str = "row";
        const KEY: &'static str = "id";
        const KEY_GENERATED: bool = true;
        const COLUMNS: &'static [&'static str] = &["id", "name"];

        fn key(&self) -> Value {
            self.id.into()
        }

        fn values(&self) -> Vec<Value> {
            vec![self.id.into(), self.name.into()]
        }
    }

    fn entries(rows: &[Row]) -> Vec<Entry> {
        rows.iter()
            .map(|r| Entry::of(r, EntityState::Added).unwrap())
            .collect()
    }

    #[test]
    fn test_rows_split_by_batch_size() {
        let rows: Vec<Row> = (0..5).map(|_| Row { id: 0, name: "x" }).collect();
        let statements = batch_inserts(&entries(&rows), 2);

        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[0].sql,
            r#"INSERT INTO "row" ("name") VALUES (?), (?)"#
        );
        assert_eq!(statements[2].params, vec![Value::from("x")]);
    }

    #[test]
    fn test_column_sets_do_not_mix() {
        let rows = vec![
            Row { id: 0, name: "a" },
            Row { id: 7, name: "b" },
            Row { id: 0, name: "c" },
        ];
        let statements = batch_inserts(&entries(&rows), 100);

        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[1].sql,
            r#"INSERT INTO "row" ("id", "name") VALUES (?, ?)"#
        );
        assert_eq!(statements[1].params, vec![Value::from(7), Value::from("b")]);
    }

    #[test]
    fn test_parameter_limit_caps_rows() {
        let rows: Vec<Row> = (1..=20_000).map(|i| Row { id: i, name: "n" }).collect();
        let statements = batch_inserts(&entries(&rows), 50_000);

        // 2 columns → at most 16383 rows per statement
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].params.len(), 16_383 * 2);
        assert!(statements.iter().all(|s| s.params.len() <= MAX_BIND_PARAMETERS));
    }

    #[test]
    fn test_empty_input() {
        assert!(batch_inserts(&[], 10).is_empty());
    }
}
