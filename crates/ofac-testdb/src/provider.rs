//! Provisioning of migrated, throwaway databases for tests.

use std::path::Path;

use ofac_db::{
    open_flags, Bootstrapper, ConnectError, ConnectOptions, ConnectionConfig, DbPool, Registry,
    RegistryError,
};
use rusqlite::Connection;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::runtime::{Instance, InstanceRuntime, ProvisionRequest, RuntimeError, TempDirRuntime};

/// Errors that can occur while provisioning a test database.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The registry to migrate with was invalid.
    #[error("invalid migration registry: {0}")]
    Registry(#[from] RegistryError),

    /// The runtime failed to create or release the instance.
    #[error("failed to provision database instance: {0}")]
    Runtime(#[from] RuntimeError),

    /// The instance never answered the readiness probe.
    #[error("database instance not reachable after {attempts} attempts: {source}")]
    NotReady {
        attempts: u32,
        source: rusqlite::Error,
    },

    /// Connecting to or migrating the ready instance failed.
    #[error("failed to bootstrap test database: {0}")]
    Bootstrap(#[from] ConnectError),
}

/// Starts instances on a runtime and hands back migrated [`TestDatabase`]s.
#[derive(Debug, Clone)]
pub struct Provisioner<R = TempDirRuntime> {
    runtime: R,
    request: ProvisionRequest,
    retry: RetryPolicy,
    options: ConnectOptions,
    registry: Option<Registry>,
}

impl Provisioner<TempDirRuntime> {
    pub fn new() -> Self {
        Self::with_runtime(TempDirRuntime::new())
    }
}

impl Default for Provisioner<TempDirRuntime> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: InstanceRuntime> Provisioner<R> {
    pub fn with_runtime(runtime: R) -> Self {
        Self {
            runtime,
            request: ProvisionRequest::default(),
            retry: RetryPolicy::default(),
            options: ConnectOptions::default(),
            registry: None,
        }
    }

    pub fn request(mut self, request: ProvisionRequest) -> Self {
        self.request = request;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Migrates with `registry` instead of the built-in one.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Starts a fresh instance, waits for it to answer, and migrates it.
    ///
    /// On any failure after the instance was created it is torn down before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError` naming the stage that failed.
    pub fn provision(&self) -> Result<TestDatabase, ProvisionError> {
        let registry = match &self.registry {
            Some(registry) => registry.clone(),
            None => Registry::builtin()?,
        };

        let mut instance = self.runtime.provision(&self.request)?;

        match self.bootstrap(instance.address(), registry) {
            Ok(pool) => Ok(TestDatabase {
                pool: Some(pool),
                instance: Some(instance),
            }),
            Err(err) => {
                if let Err(teardown_err) = instance.teardown() {
                    tracing::warn!(
                        error = %teardown_err,
                        "failed to tear down instance after provisioning error"
                    );
                }
                Err(err)
            }
        }
    }

    fn bootstrap(&self, address: &Path, registry: Registry) -> Result<DbPool, ProvisionError> {
        let config = ConnectionConfig::new(address, self.request.database.clone())
            .with_credentials(
                self.request.admin_user.clone(),
                self.request.admin_password.clone(),
            )
            .with_options(self.options);
        let dsn = config.dsn().map_err(ConnectError::from)?;

        self.retry
            .retry(|attempt| {
                probe(&dsn).inspect_err(|err| {
                    tracing::debug!(attempt, error = %err, "database instance not ready");
                })
            })
            .map_err(|exhausted| ProvisionError::NotReady {
                attempts: exhausted.attempts,
                source: exhausted.last,
            })?;

        Ok(Bootstrapper::new(config, registry).connect()?)
    }
}

/// Opens a single short-lived connection and runs `SELECT 1`.
fn probe(dsn: &str) -> Result<(), rusqlite::Error> {
    let conn = Connection::open_with_flags(dsn, open_flags())?;
    conn.query_row("SELECT 1", [], |_| Ok(()))
}

/// A migrated database bundled with the instance it lives in.
///
/// [`close`](TestDatabase::close) releases the pool and then the instance.
/// It is also run on drop, so every exit path of a test cleans up.
pub struct TestDatabase {
    pool: Option<DbPool>,
    instance: Option<Box<dyn Instance>>,
}

impl TestDatabase {
    /// Provisions a database with the default provisioner.
    ///
    /// # Panics
    ///
    /// Panics if provisioning fails; a test cannot continue without its
    /// database.
    pub fn create() -> Self {
        match Provisioner::new().provision() {
            Ok(db) => db,
            Err(err) => panic!("failed to provision test database: {err}"),
        }
    }

    /// The migrated pool, or `None` once closed.
    pub fn pool(&self) -> Option<&DbPool> {
        self.pool.as_ref()
    }

    /// Address of the backing instance, or `None` once closed.
    pub fn address(&self) -> Option<&Path> {
        self.instance.as_ref().map(|instance| instance.address())
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_none() && self.instance.is_none()
    }

    /// Drops the pool, then tears down the instance. Closing an already
    /// closed database succeeds without doing anything.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::Runtime` if the instance cannot be removed.
    pub fn close(&mut self) -> Result<(), ProvisionError> {
        drop(self.pool.take());
        if let Some(mut instance) = self.instance.take() {
            instance.teardown()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TestDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDatabase")
            .field("address", &self.address())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to tear down test database");
        }
    }
}
