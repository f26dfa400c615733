//! # Database Configuration
//!
//! Connection and bulk-write settings for units of work.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     KEEL_CONNECTION_STRING="Data Source=/data;Database=ods;"           │
//! │     KEEL_BULK_BATCH_SIZE=2000                                          │
//! │     KEEL_BUSY_TIMEOUT_MS=5000                                          │
//! │                                                                         │
//! │  2. TOML Config File (path supplied by the caller)                     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Data Source=.;Database=keel;  batch 5000 rows / 30 s               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # keel.toml
//! connection_string = "Data Source=/var/lib/keel;Database=ods;"
//! busy_timeout_ms = 5000
//! ensure_schema = true
//!
//! [bulk]
//! batch_size = 5000
//! batch_timeout_ms = 30000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connection::ConnectionString;
use crate::error::{DbError, DbResult};

// =============================================================================
// Bulk Options
// =============================================================================

/// Settings for [`crate::Repository::bulk_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOptions {
    /// Rows per batch.
    /// Default: 5000
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Deadline for each batch (milliseconds).
    /// Default: 30000
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    5000
}

fn default_batch_timeout() -> u64 {
    30_000
}

impl Default for BulkOptions {
    fn default() -> Self {
        BulkOptions {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout(),
        }
    }
}

impl BulkOptions {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("Data Source=./data;Database=ods;")
///     .busy_timeout(Duration::from_secs(10))
///     .bulk_batch_size(2000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// `;`-separated connection string, see [`crate::connection`].
    pub connection_string: String,

    /// How long SQLite waits on a locked database (milliseconds).
    /// Default: 5000
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Whether opening a context applies the schema's pending statements.
    /// Default: true
    #[serde(default = "default_ensure_schema")]
    pub ensure_schema: bool,

    /// Bulk insert settings.
    #[serde(default)]
    pub bulk: BulkOptions,
}

/// Whole milliseconds, rounding sub-millisecond remainders up.
fn millis(timeout: Duration) -> u64 {
    let whole = timeout.as_millis() + u128::from(timeout.subsec_nanos() % 1_000_000 != 0);
    u64::try_from(whole).unwrap_or(u64::MAX)
}

fn default_connection_string() -> String {
    "Data Source=.;Database=keel;".to_string()
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_ensure_schema() -> bool {
    true
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::new(default_connection_string())
    }
}

impl DbConfig {
    /// Creates a configuration for the given connection string.
    ///
    /// ## Arguments
    /// * `connection_string` - e.g. `Data Source=./data;Database=ods;`
    pub fn new(connection_string: impl Into<String>) -> Self {
        DbConfig {
            connection_string: connection_string.into(),
            busy_timeout_ms: default_busy_timeout(),
            ensure_schema: default_ensure_schema(),
            bulk: BulkOptions::default(),
        }
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// Every unit of work built from it opens its own private database;
    /// `name` is kept in the `Database=<name>;` segment so switches work.
    ///
    /// ## Usage
    /// ```rust,ignore
    /// let config = DbConfig::in_memory("ods");
    /// let uow = Database::<OdsSchema>::new(config)?.unit_of_work();
    /// ```
    pub fn in_memory(name: &str) -> Self {
        DbConfig::new(format!("Data Source=:memory:;Database={};", name))
    }

    /// Sets the busy timeout.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = millis(timeout);
        self
    }

    /// Sets whether to apply the schema on open.
    pub fn ensure_schema(mut self, ensure: bool) -> Self {
        self.ensure_schema = ensure;
        self
    }

    /// Sets the bulk insert batch size.
    pub fn bulk_batch_size(mut self, rows: usize) -> Self {
        self.bulk.batch_size = rows;
        self
    }

    /// Sets the bulk insert batch timeout.
    pub fn bulk_batch_timeout(mut self, timeout: Duration) -> Self {
        self.bulk.batch_timeout_ms = millis(timeout);
        self
    }

    pub fn busy_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn connection(&self) -> ConnectionString {
        ConnectionString::new(self.connection_string.clone())
    }

    /// Loads configuration from a TOML file and the environment.
    ///
    /// ## Arguments
    /// * `path` - Config file; missing files fall back to defaults
    ///
    /// ## Returns
    /// * `Ok(DbConfig)` - Merged and validated configuration
    /// * `Err(DbError::InvalidConfig)` - Unreadable file, bad TOML, or failed validation
    pub fn load(path: Option<&Path>) -> DbResult<Self> {
        let mut config = Self::default();

        if let Some(path) = path {
            if path.exists() {
                info!(?path, "Loading database config from file");
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| DbError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
                config = Self::from_toml_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration, falling back to defaults on error.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("Failed to load database config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn from_toml_str(contents: &str) -> DbResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml_string(&self) -> DbResult<String> {
        toml::to_string_pretty(self).map_err(|e| DbError::InvalidConfig(e.to_string()))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> DbResult<()> {
        if self.connection_string.trim().is_empty() {
            return Err(DbError::InvalidConfig(
                "connection_string must not be empty".to_string(),
            ));
        }

        let connection = self.connection();
        connection.mode()?;
        connection.foreign_keys()?;

        if self.bulk.batch_size == 0 {
            return Err(DbError::InvalidConfig(
                "bulk.batch_size must be at least 1".to_string(),
            ));
        }

        if self.bulk.batch_timeout_ms == 0 {
            return Err(DbError::InvalidConfig(
                "bulk.batch_timeout_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Applies `KEEL_*` overrides from `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cs) = lookup("KEEL_CONNECTION_STRING") {
            debug!("Overriding connection string from environment");
            self.connection_string = cs;
        }

        if let Some(size) = lookup("KEEL_BULK_BATCH_SIZE") {
            match size.parse::<usize>() {
                Ok(n) => self.bulk.batch_size = n,
                Err(_) => warn!(value = %size, "Ignoring non-numeric KEEL_BULK_BATCH_SIZE"),
            }
        }

        if let Some(ms) = lookup("KEEL_BUSY_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.busy_timeout_ms = ms;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DbConfig::default();
        assert_eq!(config.bulk.batch_size, 5000);
        assert_eq!(config.bulk.batch_timeout(), Duration::from_secs(30));
        assert!(config.ensure_schema);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DbConfig::in_memory("ods");
        assert!(config.validate().is_ok());

        config.bulk.batch_size = 0;
        assert!(config.validate().is_err());

        let config = DbConfig::new("  ");
        assert!(config.validate().is_err());

        let config = DbConfig::new("Data Source=.;Mode=Sideways;");
        assert!(config.validate().is_err());

        let config = DbConfig::in_memory("ods").bulk_batch_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sub_second_timeouts_are_kept() {
        let config = DbConfig::in_memory("ods")
            .bulk_batch_timeout(Duration::from_millis(500))
            .busy_timeout(Duration::from_micros(1_500));

        assert_eq!(config.bulk.batch_timeout(), Duration::from_millis(500));
        // Sub-millisecond remainders round up rather than down to zero
        assert_eq!(config.busy_timeout_ms, 2);
        assert_eq!(
            DbConfig::in_memory("ods")
                .bulk_batch_timeout(Duration::from_nanos(1))
                .bulk
                .batch_timeout_ms,
            1
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_partial_file_uses_defaults() {
        let config = DbConfig::from_toml_str(
            r#"
            connection_string = "Data Source=/tmp;Database=ods;"

            [bulk]
            batch_size = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.connection_string, "Data Source=/tmp;Database=ods;");
        assert_eq!(config.bulk.batch_size, 250);
        assert_eq!(config.bulk.batch_timeout_ms, 30_000);
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection_string = \"Data Source=/tmp;Database=snap;\"").unwrap();
        writeln!(file, "ensure_schema = false").unwrap();

        let config = DbConfig::load(Some(file.path())).unwrap();
        assert!(!config.ensure_schema);

        let missing = DbConfig::load_or_default(Some(Path::new("/nonexistent/keel.toml")));
        assert!(missing.ensure_schema);
    }

    #[test]
    fn test_overrides() {
        let mut config = DbConfig::default();
        config.apply_overrides(|key| match key {
            "KEEL_CONNECTION_STRING" => Some("Data Source=:memory:;Database=x;".to_string()),
            "KEEL_BULK_BATCH_SIZE" => Some("12".to_string()),
            _ => None,
        });

        assert_eq!(config.connection_string, "Data Source=:memory:;Database=x;");
        assert_eq!(config.bulk.batch_size, 12);

        config.apply_overrides(|key| (key == "KEEL_BULK_BATCH_SIZE").then(|| "many".to_string()));
        assert_eq!(config.bulk.batch_size, 12);
    }

    #[test]
    fn test_toml_serialization() {
        let config = DbConfig::in_memory("ods");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("[bulk]"));
        assert!(toml_str.contains("connection_string"));
    }
}
