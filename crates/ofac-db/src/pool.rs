//! Connection parameters and pool creation.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

/// Default time allowed for establishing pooled connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine-specific tunables applied to every pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// How long pool creation and checkout wait for a working connection.
    pub connect_timeout: Duration,

    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// Where and how to reach a database.
///
/// The address is the directory holding the database file and the database
/// name is the file stem, so `address = /var/lib/ofac`, `database = ofac`
/// resolves to `/var/lib/ofac/ofac.db`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub user: String,
    pub password: String,
    pub address: PathBuf,
    pub database: String,
    pub options: ConnectOptions,
}

impl ConnectionConfig {
    pub fn new(address: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            address: address.into(),
            database: database.into(),
            options: ConnectOptions::default(),
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Filesystem path of the database file.
    pub fn database_path(&self) -> PathBuf {
        self.address.join(format!("{}.db", self.database))
    }

    /// SQLite URI for the database, opened read-write and created if absent.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NonUtf8Address` if the database path is not valid
    /// UTF-8 and so cannot be written into a URI.
    pub fn dsn(&self) -> Result<String, PoolError> {
        let path = self.database_path();
        let raw = path
            .to_str()
            .ok_or_else(|| PoolError::NonUtf8Address(path.clone()))?;
        Ok(format!("file:{}?mode=rwc", uri_escape(raw)))
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("address", &self.address)
            .field("database", &self.database)
            .field("options", &self.options)
            .finish()
    }
}

fn uri_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '?' => escaped.push_str("%3f"),
            '#' => escaped.push_str("%23"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors that can occur when creating the database pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),

    /// The database path cannot be expressed as a SQLite URI.
    #[error("database path is not valid UTF-8: {}", .0.display())]
    NonUtf8Address(PathBuf),
}

/// Flags every connection is opened with.
pub fn open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX
}

/// Creates a SQLite connection pool with UTF-8 encoding, WAL mode and
/// foreign keys enabled.
///
/// # Errors
///
/// Returns `PoolError::NonUtf8Address` before opening anything if the path
/// is not UTF-8, or `PoolError::PoolInit` if no working connection can be
/// opened within `options.connect_timeout`.
pub fn create_pool(config: &ConnectionConfig) -> Result<DbPool, PoolError> {
    let busy_timeout_ms = config.options.busy_timeout_ms;

    let manager = SqliteConnectionManager::file(config.dsn()?)
        .with_flags(open_flags())
        .with_init(move |conn| {
            // Only takes effect when the file is first created.
            conn.execute_batch(&format!(
                "PRAGMA encoding = 'UTF-8';
                 PRAGMA busy_timeout = {busy_timeout_ms};"
            ))?;

            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }

            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });

    let pool = Pool::builder()
        .max_size(config.options.pool_max_size)
        .connection_timeout(config.options.connect_timeout)
        .build(manager)?;

    Ok(pool)
}
