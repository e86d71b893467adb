//! Disposable, fully migrated OFAC databases for tests.
//!
//! A [`Provisioner`] asks an [`InstanceRuntime`] for a fresh instance, polls
//! it under a [`RetryPolicy`] until it answers, then bootstraps it with
//! `ofac_db`. The resulting [`TestDatabase`] owns both the pool and the
//! instance and releases them in that order.
//!
//! ```rust,ignore
//! let db = ofac_testdb::TestDatabase::create();
//! let conn = db.pool().expect("open").get()?;
//! ```

mod provider;
mod retry;
mod runtime;

pub use provider::{ProvisionError, Provisioner, TestDatabase};
pub use retry::{RetryExhausted, RetryPolicy};
pub use runtime::{
    Instance, InstanceRuntime, ProvisionRequest, RuntimeError, TempDirRuntime,
    BOOTSTRAP_DATABASE, BOOTSTRAP_PASSWORD, BOOTSTRAP_USER, SQLITE_ENGINE,
};
