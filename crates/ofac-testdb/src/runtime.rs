//! Instance runtimes: where ephemeral databases come from.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;

/// Bootstrap user for provisioned instances.
pub const BOOTSTRAP_USER: &str = "moov";

/// Bootstrap password for provisioned instances.
pub const BOOTSTRAP_PASSWORD: &str = "secret";

/// Database name created in provisioned instances.
pub const BOOTSTRAP_DATABASE: &str = "ofac";

/// Engine identifier understood by [`TempDirRuntime`].
pub const SQLITE_ENGINE: &str = "sqlite";

/// What a runtime is asked to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub engine: String,
    pub version: String,
    pub admin_user: String,
    pub admin_password: String,
    pub root_password: String,
    pub database: String,
}

impl Default for ProvisionRequest {
    fn default() -> Self {
        Self {
            engine: SQLITE_ENGINE.to_string(),
            version: rusqlite::version().to_string(),
            admin_user: BOOTSTRAP_USER.to_string(),
            admin_password: BOOTSTRAP_PASSWORD.to_string(),
            root_password: BOOTSTRAP_PASSWORD.to_string(),
            database: BOOTSTRAP_DATABASE.to_string(),
        }
    }
}

/// Errors reported by an instance runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime cannot start this engine.
    #[error("runtime does not support engine '{0}'")]
    UnsupportedEngine(String),

    /// Creating or removing the instance failed.
    #[error("instance runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A provisioned database instance.
pub trait Instance: Send {
    /// Address to connect to. For SQLite this is the directory holding the
    /// database file.
    fn address(&self) -> &Path;

    /// Releases the instance. Calling it again after success is a no-op.
    fn teardown(&mut self) -> Result<(), RuntimeError>;
}

/// Something able to start fresh database instances.
pub trait InstanceRuntime {
    fn provision(&self, request: &ProvisionRequest) -> Result<Box<dyn Instance>, RuntimeError>;
}

/// Provisions each instance as a new, empty temporary directory.
#[derive(Debug, Clone, Default)]
pub struct TempDirRuntime {
    root: Option<PathBuf>,
}

impl TempDirRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates instance directories under `root` instead of the system
    /// temp directory.
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl InstanceRuntime for TempDirRuntime {
    fn provision(&self, request: &ProvisionRequest) -> Result<Box<dyn Instance>, RuntimeError> {
        if request.engine != SQLITE_ENGINE {
            return Err(RuntimeError::UnsupportedEngine(request.engine.clone()));
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("ofac-testdb-");
        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        tracing::debug!(
            engine = %request.engine,
            version = %request.version,
            path = %dir.path().display(),
            "provisioned temporary database instance"
        );

        Ok(Box::new(TempDirInstance {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        }))
    }
}

struct TempDirInstance {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Instance for TempDirInstance {
    fn address(&self) -> &Path {
        &self.path
    }

    fn teardown(&mut self) -> Result<(), RuntimeError> {
        if let Some(dir) = self.dir.take() {
            dir.close()?;
            tracing::debug!(path = %self.path.display(), "removed temporary database instance");
        }
        Ok(())
    }
}
