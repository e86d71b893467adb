//! Database bootstrap for the OFAC service.
//!
//! Opens a SQLite connection pool (via `r2d2`), confirms the database
//! answers, and brings its schema up to date by applying an ordered
//! registry of migration steps. Every table the service uses is created
//! through a step in [`BUILTIN_STEPS`].
//!
//! # Design decisions
//!
//! - **Registry as static data**: steps are declared in code, in order, so
//!   the schema history is reviewable in one place and ships with the binary.
//! - **Forward-only tracking**: applied step ids live in `_ofac_migrations`.
//!   Rows are only ever inserted, never rewritten or deleted.
//! - **One transaction per step**: a step's statements and its tracker row
//!   commit together under `BEGIN IMMEDIATE`, which also serialises
//!   concurrent bootstrappers on the same file.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ofac_db::{connect, ConnectionConfig};
//!
//! let pool = connect(ConnectionConfig::new("/var/lib/ofac", "ofac"))?;
//! let conn = pool.get()?;
//! ```

mod bootstrap;
mod migrations;
mod pool;
mod registry;

pub use bootstrap::{connect, ping, Bootstrapper, ConnectError};
pub use migrations::{
    migrate, run_migrations, status, MigrationError, MigrationReport, StepStatus, TRACKER_TABLE,
};
pub use pool::{
    create_pool, open_flags, ConnectOptions, ConnectionConfig, DbPool, PoolError,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use registry::{Registry, RegistryError, Step, BUILTIN_STEPS};
