//! # Connection Strings
//!
//! Parses `;`-separated `key=value` connection strings into sqlx options and
//! rewrites the database name for runtime switches.
//!
//! ## Recognised Keys
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Data Source=/var/lib/keel;Database=ods;Mode=ReadWriteCreate;          │
//! │                                                                         │
//! │  Data Source   Directory holding the database files, or :memory:       │
//! │  Database      Name; the file is <Data Source>/<Database>.db           │
//! │  Mode          ReadWriteCreate (default) | ReadWrite | ReadOnly | Memory│
//! │  Foreign Keys  true (default) | false                                  │
//! │                                                                         │
//! │  Keys are case-insensitive; unknown keys are ignored.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Switching Databases
//! The switch path is textual: it replaces the `Database=<name>;` segment and
//! nothing else. A string without that exact segment (for example one that
//! ends in `Database=ods` with no trailing `;`) cannot be switched.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};

use crate::error::{DbError, DbResult};

static DATABASE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([Dd]atabase=)\w+;").expect("valid database segment regex"));

static DATABASE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w+$").expect("valid database name regex"));

/// How the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWriteCreate,
    ReadWrite,
    ReadOnly,
    Memory,
}

impl FromStr for OpenMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "readwritecreate" => Ok(OpenMode::ReadWriteCreate),
            "readwrite" => Ok(OpenMode::ReadWrite),
            "readonly" => Ok(OpenMode::ReadOnly),
            "memory" => Ok(OpenMode::Memory),
            other => Err(DbError::InvalidConfig(format!(
                "unknown connection mode '{}'",
                other
            ))),
        }
    }
}

/// Returns true when `name` can be written into a `Database=<name>;` segment.
pub fn is_valid_database_name(name: &str) -> bool {
    DATABASE_NAME.is_match(name)
}

/// A connection string, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    raw: String,
}

impl ConnectionString {
    pub fn new(raw: impl Into<String>) -> Self {
        ConnectionString { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Value of `key`, matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// The `Database` value, if present.
    pub fn database(&self) -> Option<&str> {
        self.get("database")
    }

    pub fn mode(&self) -> DbResult<OpenMode> {
        if self.get("data source") == Some(":memory:") {
            return Ok(OpenMode::Memory);
        }
        self.get("mode")
            .map_or(Ok(OpenMode::ReadWriteCreate), OpenMode::from_str)
    }

    pub fn foreign_keys(&self) -> DbResult<bool> {
        match self.get("foreign keys") {
            None => Ok(true),
            Some(v) => v.to_ascii_lowercase().parse::<bool>().map_err(|_| {
                DbError::InvalidConfig(format!("Foreign Keys must be true or false, got '{}'", v))
            }),
        }
    }

    /// A copy with the `Database=<name>;` segment pointing at `name`.
    ///
    /// ## Returns
    /// * `Ok(ConnectionString)` - Rewritten string
    /// * `Err(DbError::InvalidArgument)` - `name` is not a word
    /// * `Err(DbError::InvalidConfig)` - No `Database=<name>;` segment to rewrite
    pub fn with_database(&self, name: &str) -> DbResult<ConnectionString> {
        if !is_valid_database_name(name) {
            return Err(DbError::invalid_argument(format!(
                "database name '{}' must be a non-empty word",
                name
            )));
        }
        if !DATABASE_SEGMENT.is_match(&self.raw) {
            return Err(DbError::InvalidConfig(
                "connection string has no Database=<name>; segment".to_string(),
            ));
        }

        let replacement = format!("${{1}}{};", name);
        Ok(ConnectionString::new(
            DATABASE_SEGMENT
                .replace(&self.raw, replacement.as_str())
                .into_owned(),
        ))
    }

    /// Path of the database file, `None` in memory mode.
    pub fn file_path(&self) -> DbResult<Option<PathBuf>> {
        if self.mode()? == OpenMode::Memory {
            return Ok(None);
        }
        let source = self.get("data source").ok_or_else(|| {
            DbError::InvalidConfig("connection string has no Data Source".to_string())
        })?;

        Ok(Some(match self.database() {
            Some(db) => Path::new(source).join(format!("{}.db", db)),
            None => PathBuf::from(source),
        }))
    }

    /// sqlx options for one connection.
    ///
    /// WAL journal and NORMAL synchronous for file databases; foreign keys
    /// follow the `Foreign Keys` key.
    pub fn connect_options(&self, busy_timeout: Duration) -> DbResult<SqliteConnectOptions> {
        let mode = self.mode()?;

        let options = match self.file_path()? {
            None => SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::InvalidConfig(e.to_string()))?,
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(mode == OpenMode::ReadWriteCreate)
                .read_only(mode == OpenMode::ReadOnly)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
        };

        Ok(options
            .foreign_keys(self.foreign_keys()?)
            .busy_timeout(busy_timeout))
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for ConnectionString {
    fn from(raw: &str) -> Self {
        ConnectionString::new(raw)
    }
}

impl From<String> for ConnectionString {
    fn from(raw: String) -> Self {
        ConnectionString::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys_case_insensitive() {
        let cs = ConnectionString::new("data source=/tmp/keel; DATABASE = ods ;Mode=ReadOnly;");
        assert_eq!(cs.get("Data Source"), Some("/tmp/keel"));
        assert_eq!(cs.database(), Some("ods"));
        assert_eq!(cs.mode().unwrap(), OpenMode::ReadOnly);
        assert!(cs.foreign_keys().unwrap());
        assert_eq!(
            cs.file_path().unwrap(),
            Some(PathBuf::from("/tmp/keel/ods.db"))
        );
    }

    #[test]
    fn test_memory_source() {
        let cs = ConnectionString::new("Data Source=:memory:;Database=main;");
        assert_eq!(cs.mode().unwrap(), OpenMode::Memory);
        assert_eq!(cs.file_path().unwrap(), None);
        assert!(cs.connect_options(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_with_database_rewrites_segment() {
        let cs = ConnectionString::new("Data Source=/tmp;Database=ods;Mode=ReadWriteCreate;");
        let switched = cs.with_database("snapshot").unwrap();
        assert_eq!(
            switched.as_str(),
            "Data Source=/tmp;Database=snapshot;Mode=ReadWriteCreate;"
        );
        assert_eq!(switched.database(), Some("snapshot"));
    }

    #[test]
    fn test_with_database_requires_segment() {
        // No trailing ';' after the name
        let cs = ConnectionString::new("Data Source=/tmp;Database=ods");
        assert!(matches!(
            cs.with_database("snapshot"),
            Err(DbError::InvalidConfig(_))
        ));

        let cs = ConnectionString::new("Data Source=:memory:");
        assert!(cs.with_database("snapshot").is_err());
    }

    #[test]
    fn test_with_database_rejects_non_word() {
        let cs = ConnectionString::new("Data Source=/tmp;Database=ods;");
        assert!(matches!(
            cs.with_database("bad name"),
            Err(DbError::InvalidArgument(_))
        ));
        assert!(matches!(cs.with_database(""), Err(DbError::InvalidArgument(_))));
    }

    #[test]
    fn test_invalid_mode_and_flag() {
        let cs = ConnectionString::new("Data Source=/tmp;Mode=Sideways;");
        assert!(matches!(cs.mode(), Err(DbError::InvalidConfig(_))));

        let cs = ConnectionString::new("Data Source=/tmp;Foreign Keys=maybe;");
        assert!(cs.foreign_keys().is_err());
    }

    #[test]
    fn test_missing_data_source() {
        let cs = ConnectionString::new("Database=ods;");
        assert!(matches!(cs.file_path(), Err(DbError::InvalidConfig(_))));
    }
}
