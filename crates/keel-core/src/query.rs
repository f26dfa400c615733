//! # Query Composition
//!
//! A small AST for the queries the query builder composes, rendered to
//! SQLite text with anonymous `?` placeholders.
//!
//! ## Composition Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        QuerySpec composition                            │
//! │                                                                         │
//! │  filter(a).filter(b)     → WHERE a AND b        (filters accumulate)   │
//! │  order(x).order(y)       → ORDER BY y           (ordering replaces)    │
//! │  skip(3).skip(5)         → OFFSET 5             (paging replaces)      │
//! │                                                                         │
//! │  skip(3).filter(a)       → SELECT * FROM (                             │
//! │                               SELECT * FROM t LIMIT -1 OFFSET 3        │
//! │                            ) AS "src" WHERE a                          │
//! │                            (composing after paging works on the page)  │
//! │                                                                         │
//! │  from_sql(raw, params)   → SELECT * FROM (raw) AS "src"                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::value::Value;

// =============================================================================
// Statement
// =============================================================================

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Statement {
            sql: sql.into(),
            params,
        }
    }
}

/// Quotes an identifier for SQLite, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders `?, ?, ?` for `count` placeholders.
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

// =============================================================================
// Filters
// =============================================================================

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    Like {
        column: String,
        pattern: String,
    },
    IsNull(String),
    IsNotNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// Raw predicate text with its own `?` parameters.
    Raw(Statement),
}

impl Filter {
    /// Raw SQL predicate, e.g. `Filter::raw("level * 2 > ?", vec![4.into()])`.
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Filter::Raw(Statement::new(sql, params))
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Appends this predicate to `sql`, pushing parameters in order.
    pub fn render_into(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            // `= NULL` never matches in SQL; callers mean IS NULL
            Filter::Compare {
                column,
                op: CompareOp::Eq,
                value: Value::Null,
            } => {
                sql.push_str(&format!("{} IS NULL", quote_ident(column)));
            }
            Filter::Compare {
                column,
                op: CompareOp::Ne,
                value: Value::Null,
            } => {
                sql.push_str(&format!("{} IS NOT NULL", quote_ident(column)));
            }
            Filter::Compare { column, op, value } => {
                sql.push_str(&format!("{} {} ?", quote_ident(column), op.as_sql()));
                params.push(value.clone());
            }
            Filter::In { column, values } => {
                if values.is_empty() {
                    sql.push_str("1 = 0");
                } else {
                    sql.push_str(&format!(
                        "{} IN ({})",
                        quote_ident(column),
                        placeholders(values.len())
                    ));
                    params.extend(values.iter().cloned());
                }
            }
            Filter::Like { column, pattern } => {
                sql.push_str(&format!("{} LIKE ?", quote_ident(column)));
                params.push(Value::Text(pattern.clone()));
            }
            Filter::IsNull(column) => {
                sql.push_str(&format!("{} IS NULL", quote_ident(column)));
            }
            Filter::IsNotNull(column) => {
                sql.push_str(&format!("{} IS NOT NULL", quote_ident(column)));
            }
            Filter::And(parts) => render_group(parts, " AND ", "1 = 1", sql, params),
            Filter::Or(parts) => render_group(parts, " OR ", "1 = 0", sql, params),
            Filter::Not(inner) => {
                sql.push_str("NOT (");
                inner.render_into(sql, params);
                sql.push(')');
            }
            Filter::Raw(stmt) => {
                sql.push('(');
                sql.push_str(&stmt.sql);
                sql.push(')');
                params.extend(stmt.params.iter().cloned());
            }
        }
    }
}

fn render_group(
    parts: &[Filter],
    joiner: &str,
    empty: &str,
    sql: &mut String,
    params: &mut Vec<Value>,
) {
    if parts.is_empty() {
        sql.push_str(empty);
        return;
    }
    sql.push('(');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            sql.push_str(joiner);
        }
        part.render_into(sql, params);
    }
    sql.push(')');
}

/// Column handle for building filters: `col("fund_key").eq("Fund1")`.
#[derive(Debug, Clone)]
pub struct Col(String);

/// Starts a filter on `name`.
pub fn col(name: impl Into<String>) -> Col {
    Col(name.into())
}

impl Col {
    fn compare(self, op: CompareOp, value: impl Into<Value>) -> Filter {
        Filter::Compare {
            column: self.0,
            op,
            value: value.into(),
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Eq, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Ne, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Lt, value)
    }

    pub fn le(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Le, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Gt, value)
    }

    pub fn ge(self, value: impl Into<Value>) -> Filter {
        self.compare(CompareOp::Ge, value)
    }

    pub fn like(self, pattern: impl Into<String>) -> Filter {
        Filter::Like {
            column: self.0,
            pattern: pattern.into(),
        }
    }

    pub fn is_in<I, V>(self, values: I) -> Filter
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In {
            column: self.0,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(self) -> Filter {
        Filter::IsNull(self.0)
    }

    pub fn is_not_null(self) -> Filter {
        Filter::IsNotNull(self.0)
    }
}

// =============================================================================
// Ordering
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: String,
    pub direction: Direction,
}

/// An ordering chain: `Sort::asc("level").then_desc("name")`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sort {
    terms: Vec<OrderTerm>,
}

impl Sort {
    pub fn asc(column: impl Into<String>) -> Self {
        Sort::default().then_asc(column)
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Sort::default().then_desc(column)
    }

    pub fn then_asc(mut self, column: impl Into<String>) -> Self {
        self.terms.push(OrderTerm {
            column: column.into(),
            direction: Direction::Asc,
        });
        self
    }

    pub fn then_desc(mut self, column: impl Into<String>) -> Self {
        self.terms.push(OrderTerm {
            column: column.into(),
            direction: Direction::Desc,
        });
        self
    }

    pub fn terms(&self) -> &[OrderTerm] {
        &self.terms
    }
}

// =============================================================================
// QuerySpec
// =============================================================================

/// Where rows come from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table(String),
    Raw(Statement),
    Subquery(Box<QuerySpec>),
}

/// A composed SELECT over one source.
///
/// ## Example
/// ```rust
/// use keel_core::query::{col, QuerySpec, Sort};
///
/// let mut spec = QuerySpec::table("asset_hierarchy_level");
/// spec.filter(col("level").gt(2));
/// spec.order(Sort::desc("level"));
/// spec.take(3);
///
/// let stmt = spec.render();
/// assert_eq!(
///     stmt.sql,
///     r#"SELECT * FROM "asset_hierarchy_level" WHERE "level" > ? ORDER BY "level" DESC LIMIT 3"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    source: Source,
    filters: Vec<Filter>,
    order: Vec<OrderTerm>,
    skip: Option<u64>,
    take: Option<u64>,
}

impl QuerySpec {
    /// Selects every row of `table`.
    pub fn table(table: impl Into<String>) -> Self {
        QuerySpec::over(Source::Table(table.into()))
    }

    /// Selects from raw SQL.
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        QuerySpec::over(Source::Raw(Statement::new(sql, params)))
    }

    fn over(source: Source) -> Self {
        QuerySpec {
            source,
            filters: Vec::new(),
            order: Vec::new(),
            skip: None,
            take: None,
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn ordering(&self) -> &[OrderTerm] {
        &self.order
    }

    pub fn is_paged(&self) -> bool {
        self.skip.is_some() || self.take.is_some()
    }

    // Wraps a paged query so the next composition applies to the page.
    fn nest_if_paged(&mut self) {
        if self.is_paged() {
            let inner = std::mem::replace(self, QuerySpec::table(String::new()));
            *self = QuerySpec::over(Source::Subquery(Box::new(inner)));
        }
    }

    pub fn filter(&mut self, filter: Filter) {
        self.nest_if_paged();
        self.filters.push(filter);
    }

    pub fn order(&mut self, sort: Sort) {
        self.nest_if_paged();
        self.order = sort.terms;
    }

    pub fn skip(&mut self, count: u64) {
        self.skip = Some(count);
    }

    pub fn take(&mut self, count: u64) {
        self.take = Some(count);
    }

    /// A copy with an extra predicate applied after paging.
    pub fn narrowed(&self, filter: Option<Filter>) -> QuerySpec {
        let mut spec = self.clone();
        if let Some(filter) = filter {
            spec.filter(filter);
        }
        spec
    }

    /// A copy limited to the first row.
    pub fn first(&self) -> QuerySpec {
        let mut spec = self.clone();
        spec.take = Some(spec.take.map_or(1, |t| t.min(1)));
        spec
    }

    /// `SELECT *`.
    pub fn render(&self) -> Statement {
        self.render_projection("*")
    }

    /// `SELECT "a", "b"`.
    pub fn render_columns(&self, columns: &[&str]) -> Statement {
        if columns.is_empty() {
            return self.render();
        }
        let projection = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        self.render_projection(&projection)
    }

    /// `SELECT COUNT(*)`, counting only the page when paged.
    pub fn render_count(&self) -> Statement {
        if self.is_paged() {
            let inner = self.render();
            return Statement::new(
                format!("SELECT COUNT(*) FROM ({}) AS \"counted\"", inner.sql),
                inner.params,
            );
        }

        let mut sql = String::from("SELECT COUNT(*) FROM ");
        let mut params = Vec::new();
        self.render_source(&mut sql, &mut params);
        self.render_where(&mut sql, &mut params);
        Statement::new(sql, params)
    }

    fn render_projection(&self, projection: &str) -> Statement {
        let mut sql = format!("SELECT {} FROM ", projection);
        let mut params = Vec::new();

        self.render_source(&mut sql, &mut params);
        self.render_where(&mut sql, &mut params);

        if !self.order.is_empty() {
            let terms = self
                .order
                .iter()
                .map(|t| match t.direction {
                    Direction::Asc => quote_ident(&t.column),
                    Direction::Desc => format!("{} DESC", quote_ident(&t.column)),
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms);
        }

        // SQLite only accepts OFFSET after LIMIT; -1 means unbounded.
        // Both are signed 64-bit in SQLite.
        let take = self.take.map(clamp_i64);
        let skip = self.skip.map(clamp_i64);
        match (take, skip) {
            (Some(take), Some(skip)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", take, skip)),
            (Some(take), None) => sql.push_str(&format!(" LIMIT {}", take)),
            (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", skip)),
            (None, None) => {}
        }

        Statement::new(sql, params)
    }

    fn render_source(&self, sql: &mut String, params: &mut Vec<Value>) {
        match &self.source {
            Source::Table(name) => sql.push_str(&quote_ident(name)),
            Source::Raw(stmt) => {
                sql.push_str(&format!("({}) AS \"src\"", stmt.sql));
                params.extend(stmt.params.iter().cloned());
            }
            Source::Subquery(inner) => {
                let stmt = inner.render();
                sql.push_str(&format!("({}) AS \"src\"", stmt.sql));
                params.extend(stmt.params);
            }
        }
    }

    fn render_where(&self, sql: &mut String, params: &mut Vec<Value>) {
        if self.filters.is_empty() {
            return;
        }
        sql.push_str(" WHERE ");
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }
            filter.render_into(sql, params);
        }
    }
}

fn clamp_i64(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_accumulate() {
        let mut spec = QuerySpec::table("dim_entity");
        spec.filter(col("target_type").eq("Sub Asset Class"));
        spec.filter(col("target_key").ge(4));

        let stmt = spec.render();
        assert_eq!(
            stmt.sql,
            r#"SELECT * FROM "dim_entity" WHERE "target_type" = ? AND "target_key" >= ?"#
        );
        assert_eq!(
            stmt.params,
            vec![Value::from("Sub Asset Class"), Value::from(4)]
        );
    }

    #[test]
    fn test_ordering_and_paging_replace() {
        let mut spec = QuerySpec::table("t");
        spec.order(Sort::asc("a"));
        spec.order(Sort::desc("b").then_asc("c"));
        spec.take(10);
        spec.take(2);

        assert_eq!(
            spec.render().sql,
            r#"SELECT * FROM "t" ORDER BY "b" DESC, "c" LIMIT 2"#
        );
    }

    #[test]
    fn test_paging_clamps_to_sqlite_integer_range() {
        let mut spec = QuerySpec::table("t");
        spec.skip(u64::MAX);
        spec.take(u64::MAX);
        assert_eq!(
            spec.render().sql,
            r#"SELECT * FROM "t" LIMIT 9223372036854775807 OFFSET 9223372036854775807"#
        );
    }

    #[test]
    fn test_skip_without_take_uses_unbounded_limit() {
        let mut spec = QuerySpec::table("t");
        spec.skip(3);
        assert_eq!(spec.render().sql, r#"SELECT * FROM "t" LIMIT -1 OFFSET 3"#);
    }

    #[test]
    fn test_filter_after_paging_nests() {
        let mut spec = QuerySpec::table("t");
        spec.skip(3);
        spec.filter(col("a").eq(1));

        assert_eq!(
            spec.render().sql,
            r#"SELECT * FROM (SELECT * FROM "t" LIMIT -1 OFFSET 3) AS "src" WHERE "a" = ?"#
        );
    }

    #[test]
    fn test_first_keeps_offset() {
        let mut spec = QuerySpec::table("t");
        spec.skip(3);
        assert_eq!(
            spec.first().render().sql,
            r#"SELECT * FROM "t" LIMIT 1 OFFSET 3"#
        );

        // take(0) stays empty
        spec.take(0);
        assert_eq!(spec.first().render().sql, r#"SELECT * FROM "t" LIMIT 0 OFFSET 3"#);
    }

    #[test]
    fn test_count_counts_the_page() {
        let mut spec = QuerySpec::table("t");
        spec.filter(col("a").eq(1));
        spec.order(Sort::asc("a"));
        assert_eq!(
            spec.render_count().sql,
            r#"SELECT COUNT(*) FROM "t" WHERE "a" = ?"#
        );

        spec.take(5);
        assert_eq!(
            spec.render_count().sql,
            r#"SELECT COUNT(*) FROM (SELECT * FROM "t" WHERE "a" = ? ORDER BY "a" LIMIT 5) AS "counted""#
        );
    }

    #[test]
    fn test_raw_source_params_come_first() {
        let mut spec = QuerySpec::raw("SELECT * FROM t WHERE kind = ?", vec!["x".into()]);
        spec.filter(col("a").lt(9));

        let stmt = spec.render();
        assert_eq!(
            stmt.sql,
            r#"SELECT * FROM (SELECT * FROM t WHERE kind = ?) AS "src" WHERE "a" < ?"#
        );
        assert_eq!(stmt.params, vec![Value::from("x"), Value::from(9)]);
    }

    #[test]
    fn test_null_comparisons_render_is_null() {
        let mut sql = String::new();
        let mut params = Vec::new();
        col("fund_key")
            .eq(Value::Null)
            .or(col("fund_key").ne(Value::Null))
            .render_into(&mut sql, &mut params);

        assert_eq!(sql, r#"("fund_key" IS NULL OR "fund_key" IS NOT NULL)"#);
        assert!(params.is_empty());
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let mut sql = String::new();
        let mut params = Vec::new();
        col("id")
            .is_in(Vec::<i64>::new())
            .render_into(&mut sql, &mut params);
        assert_eq!(sql, "1 = 0");
    }

    #[test]
    fn test_projection_and_quoting() {
        let spec = QuerySpec::table("we\"ird");
        assert_eq!(
            spec.render_columns(&["a", "b"]).sql,
            r#"SELECT "a", "b" FROM "we""ird""#
        );
    }
}
