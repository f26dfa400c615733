//! # Database Factory
//!
//! Validated configuration plus a schema type, producing scoped units of
//! work.
//!
//! ## Usage
//! ```rust,ignore
//! let db = Database::<OdsSchema>::new(DbConfig::load(Some(path))?)?;
//!
//! let uow = db.unit_of_work();
//! uow.repository::<DimFund>()?.insert(&fund)?;
//! uow.save_changes().await?;
//! uow.dispose().await;
//! ```

use std::fmt;
use std::marker::PhantomData;

use tracing::{info, warn};

use crate::config::DbConfig;
use crate::error::DbResult;
use crate::schema::{NoSchema, Schema};
use crate::unit_of_work::UnitOfWork;

/// Factory for [`UnitOfWork`]s over schema `S`.
pub struct Database<S: Schema = NoSchema> {
    config: DbConfig,
    _schema: PhantomData<fn() -> S>,
}

impl<S: Schema> Clone for Database<S> {
    fn clone(&self) -> Self {
        Database {
            config: self.config.clone(),
            _schema: PhantomData,
        }
    }
}

impl<S: Schema> fmt::Debug for Database<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("schema", &S::NAME)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: Schema> Database<S> {
    /// Validates `config` and builds the factory. No connection is opened.
    ///
    /// ## Returns
    /// * `Ok(Database)` - Ready to hand out units of work
    /// * `Err(DbError::InvalidConfig)` - Configuration failed validation
    pub fn new(config: DbConfig) -> DbResult<Self> {
        config.validate()?;
        info!(
            schema = S::NAME,
            database = config.connection().database().unwrap_or("main"),
            "Database configured"
        );

        Ok(Database {
            config,
            _schema: PhantomData,
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// A new scoped unit of work with its own context.
    pub fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::from_validated(&self.config)
    }

    /// Checks that the database can be opened and queried.
    pub async fn health_check(&self) -> bool {
        let uow = self.unit_of_work();
        let healthy = match uow.execute_sql("SELECT 1", Vec::new()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                false
            }
        };
        uow.dispose().await;
        healthy
    }
}
