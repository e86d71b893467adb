//! Connect, verify, and migrate a database before handing it out.

use rusqlite::Connection;
use thiserror::Error;
use tracing::Dispatch;

use crate::migrations::{migrate, MigrationError};
use crate::pool::{create_pool, ConnectionConfig, DbPool, PoolError};
use crate::registry::{Registry, RegistryError};

/// Errors that can occur while bootstrapping a database handle.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The migration registry was invalid.
    #[error("invalid migration registry: {0}")]
    Registry(#[from] RegistryError),

    /// The connection pool could not be opened.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// No connection could be checked out of the pool.
    #[error("failed to check out a database connection: {0}")]
    Checkout(#[source] r2d2::Error),

    /// The liveness probe failed.
    #[error("database liveness probe failed: {0}")]
    Ping(#[source] rusqlite::Error),

    /// Migrating the database failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Opens a pool for the configured database, checks it responds, and brings
/// its schema up to date with a registry.
///
/// Logging goes to the caller's default subscriber unless a dispatch is
/// injected with [`Bootstrapper::with_dispatch`].
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    config: ConnectionConfig,
    registry: Registry,
    dispatch: Option<Dispatch>,
}

impl Bootstrapper {
    pub fn new(config: ConnectionConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            dispatch: None,
        }
    }

    /// Routes every event emitted while bootstrapping to `dispatch`.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Opens, pings, and migrates the database.
    ///
    /// No pool is returned unless all three succeed; on failure the pool
    /// opened so far is dropped before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError` describing the first stage that failed.
    pub fn connect(&self) -> Result<DbPool, ConnectError> {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, || self.connect_inner()),
            None => self.connect_inner(),
        }
    }

    fn connect_inner(&self) -> Result<DbPool, ConnectError> {
        let span = tracing::info_span!(
            "bootstrap",
            database = %self.config.database,
            address = %self.config.address.display()
        );
        let _enter = span.enter();

        tracing::info!(user = %self.config.user, "opening database");
        let pool = create_pool(&self.config)?;

        {
            let conn = pool.get().map_err(ConnectError::Checkout)?;
            ping(&conn)?;

            let report = migrate(&conn, &self.registry)?;
            if report.applied_count() > 0 {
                tracing::info!(count = report.applied_count(), "applied database migrations");
            }
        }

        Ok(pool)
    }
}

/// Bootstraps `config` with the built-in registry.
///
/// # Errors
///
/// See [`Bootstrapper::connect`].
pub fn connect(config: ConnectionConfig) -> Result<DbPool, ConnectError> {
    let registry = Registry::builtin()?;
    Bootstrapper::new(config, registry).connect()
}

/// Lightweight liveness probe.
///
/// # Errors
///
/// Returns `ConnectError::Ping` if the database does not answer.
pub fn ping(conn: &Connection) -> Result<(), ConnectError> {
    conn.query_row("SELECT 1", [], |_| Ok(()))
        .map_err(ConnectError::Ping)
}
