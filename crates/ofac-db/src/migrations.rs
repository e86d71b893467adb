//! Migration runner and tracker.
//!
//! Steps from a [`Registry`] run sequentially, tracked by the
//! `_ofac_migrations` table. Each step runs exactly once: if its id is
//! already recorded it is skipped.
//!
//! Every step executes inside its own `BEGIN IMMEDIATE` transaction that also
//! covers the tracker lookup and the tracker insert. Two processes migrating
//! the same database file therefore serialise on each step, and whichever
//! arrives second sees the step as already applied.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::registry::{Registry, RegistryError, Step};

/// Name of the table recording applied steps.
pub const TRACKER_TABLE: &str = "_ofac_migrations";

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The registry to run was invalid.
    #[error("invalid migration registry: {0}")]
    Registry(#[from] RegistryError),

    /// The tracker table could not be created.
    #[error("failed to create migration tracker table: {0}")]
    Bootstrap(#[source] rusqlite::Error),

    /// Failed to query migration state.
    #[error("failed to check migration state: {0}")]
    StateQuery(#[source] rusqlite::Error),

    /// A SQL statement within a step failed.
    #[error("migration '{step}' failed at statement {statement}: {source}")]
    ExecutionFailed {
        /// The id of the step that failed.
        step: &'static str,
        /// Zero-based index of the failing statement within the step.
        statement: usize,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The step ran but could not be recorded in the tracker.
    #[error("failed to record migration '{step}': {source}")]
    Record {
        /// The id of the step being recorded.
        step: &'static str,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// A recorded `applied_at` value could not be parsed.
    #[error("migration '{step}' has an unreadable applied_at '{value}': {source}")]
    Timestamp {
        step: &'static str,
        value: String,
        source: chrono::ParseError,
    },
}

/// Outcome of a single [`migrate`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Steps applied by this call, in order.
    pub applied: Vec<&'static str>,
    /// Steps found already recorded.
    pub skipped: Vec<&'static str>,
}

impl MigrationReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Tracker state of one registry step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub id: &'static str,
    /// When the step was recorded, or `None` if it is still pending.
    pub applied_at: Option<DateTime<Utc>>,
    /// The recorded checksum differs from the step's current statements.
    pub checksum_drift: bool,
}

impl StepStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// Runs every pending step of the built-in registry.
///
/// # Errors
///
/// Returns `MigrationError` if the built-in registry is invalid or any
/// step fails. See [`migrate`].
pub fn run_migrations(conn: &Connection) -> Result<MigrationReport, MigrationError> {
    let registry = Registry::builtin()?;
    migrate(conn, &registry)
}

/// Applies all pending steps of `registry` against `conn`, in order.
///
/// Steps already recorded in `_ofac_migrations` are skipped. The first
/// failing step aborts the run; steps before it stay recorded and the
/// failing step is not.
///
/// # Errors
///
/// Returns `MigrationError` if the tracker table cannot be created or
/// queried, or if a step fails to execute or be recorded.
pub fn migrate(conn: &Connection, registry: &Registry) -> Result<MigrationReport, MigrationError> {
    ensure_tracker(conn)?;

    let mut report = MigrationReport::default();

    for step in registry {
        if apply_step(conn, step)? {
            report.applied.push(step.id);
        } else {
            report.skipped.push(step.id);
        }
    }

    tracing::info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        "migrations complete"
    );

    Ok(report)
}

/// Reports the tracker state of every step in `registry`.
///
/// Creates the tracker table if it is missing but applies nothing.
///
/// # Errors
///
/// Returns `MigrationError` if the tracker cannot be created or read.
pub fn status(conn: &Connection, registry: &Registry) -> Result<Vec<StepStatus>, MigrationError> {
    ensure_tracker(conn)?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT checksum, applied_at FROM {TRACKER_TABLE} WHERE id = ?1"
        ))
        .map_err(MigrationError::StateQuery)?;

    let mut statuses = Vec::with_capacity(registry.len());

    for step in registry {
        let recorded: Option<(String, String)> = stmt
            .query_row([step.id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .map_err(MigrationError::StateQuery)?;

        let status = match recorded {
            Some((checksum, applied_at)) => {
                let parsed = DateTime::parse_from_rfc3339(&applied_at).map_err(|source| {
                    MigrationError::Timestamp {
                        step: step.id,
                        value: applied_at.clone(),
                        source,
                    }
                })?;
                StepStatus {
                    id: step.id,
                    applied_at: Some(parsed.with_timezone(&Utc)),
                    checksum_drift: checksum != step.checksum(),
                }
            }
            None => StepStatus {
                id: step.id,
                applied_at: None,
                checksum_drift: false,
            },
        };
        statuses.push(status);
    }

    Ok(statuses)
}

fn ensure_tracker(conn: &Connection) -> Result<(), MigrationError> {
    // Take the write lock up front so concurrent bootstrappers wait on the
    // busy timeout instead of failing on a stale WAL snapshot.
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(MigrationError::Bootstrap)?;
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TRACKER_TABLE} (
            id TEXT PRIMARY KEY NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );"
    ))
    .map_err(MigrationError::Bootstrap)?;
    tx.commit().map_err(MigrationError::Bootstrap)
}

/// Applies one step. Returns `false` if it was already recorded.
fn apply_step(conn: &Connection, step: &Step) -> Result<bool, MigrationError> {
    let checksum = step.checksum();

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(MigrationError::StateQuery)?;

    let recorded: Option<String> = tx
        .query_row(
            &format!("SELECT checksum FROM {TRACKER_TABLE} WHERE id = ?1"),
            [step.id],
            |row| row.get(0),
        )
        .optional()
        .map_err(MigrationError::StateQuery)?;

    if let Some(recorded) = recorded {
        if recorded != checksum {
            tracing::warn!(
                migration = step.id,
                recorded = %recorded,
                current = %checksum,
                "applied migration no longer matches its registered statements"
            );
        } else {
            tracing::debug!(migration = step.id, "migration already applied, skipping");
        }
        tx.rollback().map_err(MigrationError::StateQuery)?;
        return Ok(false);
    }

    tracing::info!(migration = step.id, "applying migration");

    for (index, sql) in step.statements.iter().enumerate() {
        tx.execute_batch(sql)
            .map_err(|source| MigrationError::ExecutionFailed {
                step: step.id,
                statement: index,
                source,
            })?;
    }

    let inserted = tx
        .execute(
            &format!(
                "INSERT INTO {TRACKER_TABLE} (id, checksum) VALUES (?1, ?2)
                 ON CONFLICT(id) DO NOTHING"
            ),
            params![step.id, checksum],
        )
        .map_err(|source| MigrationError::Record {
            step: step.id,
            source,
        })?;

    if inserted == 0 {
        // Recorded by someone else; keep their row and drop our side effects.
        tracing::debug!(migration = step.id, "migration recorded concurrently, rolling back");
        tx.rollback().map_err(|source| MigrationError::Record {
            step: step.id,
            source,
        })?;
        return Ok(false);
    }

    tx.commit().map_err(|source| MigrationError::Record {
        step: step.id,
        source,
    })?;

    Ok(true)
}
