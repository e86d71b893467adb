//! The ordered migration registry.
//!
//! Every table in the OFAC database is created through a [`Step`] listed in
//! [`BUILTIN_STEPS`]. Steps are applied in the order they appear, so new
//! steps are only ever appended. A published step's statements never change;
//! altering the schema again means adding another step.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// A single named unit of schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Stable identifier recorded in the tracker table.
    pub id: &'static str,
    /// SQL statements executed in order as one unit.
    pub statements: &'static [&'static str],
}

impl Step {
    pub const fn new(id: &'static str, statements: &'static [&'static str]) -> Self {
        Self { id, statements }
    }

    /// SHA-256 of the step's statements, hex encoded.
    ///
    /// Recorded alongside the step id so an edited step can be detected on
    /// databases that already applied the original.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (index, statement) in self.statements.iter().enumerate() {
            if index > 0 {
                hasher.update(b"\n");
            }
            hasher.update(statement.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// The application's schema history. New steps are appended here.
pub const BUILTIN_STEPS: &[Step] = &[
    Step::new(
        "create_customer_name_watches",
        &["CREATE TABLE IF NOT EXISTS customer_name_watches (
            id TEXT PRIMARY KEY,
            name TEXT,
            webhook TEXT,
            auth_token TEXT,
            created_at TEXT,
            deleted_at TEXT
        );"],
    ),
    Step::new(
        "create_customer_status",
        &["CREATE TABLE IF NOT EXISTS customer_status (
            customer_id TEXT,
            user_id TEXT,
            note TEXT,
            status TEXT,
            created_at TEXT,
            deleted_at TEXT
        );"],
    ),
    Step::new(
        "create_customer_watches",
        &["CREATE TABLE IF NOT EXISTS customer_watches (
            id TEXT PRIMARY KEY,
            customer_id TEXT,
            webhook TEXT,
            auth_token TEXT,
            created_at TEXT,
            deleted_at TEXT
        );"],
    ),
    Step::new(
        "create_company_name_watches",
        &["CREATE TABLE IF NOT EXISTS company_name_watches (
            id TEXT PRIMARY KEY,
            name TEXT,
            webhook TEXT,
            auth_token TEXT,
            created_at TEXT,
            deleted_at TEXT
        );"],
    ),
    Step::new(
        "create_company_status",
        &["CREATE TABLE IF NOT EXISTS company_status (
            company_id TEXT,
            user_id TEXT,
            note TEXT,
            status TEXT,
            created_at TEXT,
            deleted_at TEXT
        );"],
    ),
    Step::new(
        "create_company_watches",
        &["CREATE TABLE IF NOT EXISTS company_watches (
            id TEXT PRIMARY KEY,
            company_id TEXT,
            webhook TEXT,
            auth_token TEXT,
            created_at TEXT,
            deleted_at TEXT
        );"],
    ),
    Step::new(
        "create_ofac_download_stats",
        &["CREATE TABLE IF NOT EXISTS ofac_download_stats (
            downloaded_at TEXT,
            sdns INTEGER,
            alt_names INTEGER,
            addresses INTEGER
        );"],
    ),
    Step::new(
        "create_webhook_stats",
        &["CREATE TABLE IF NOT EXISTS webhook_stats (
            watch_id TEXT,
            attempted_at TEXT,
            status TEXT
        );"],
    ),
    Step::new(
        "add__denied_persons__to__ofac_download_stats",
        &["ALTER TABLE ofac_download_stats ADD COLUMN denied_persons INTEGER NOT NULL DEFAULT 0;"],
    ),
];

/// Errors raised while assembling a [`Registry`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two steps share the same id.
    #[error("duplicate migration id '{0}'")]
    DuplicateId(&'static str),

    /// A step was declared with an empty id.
    #[error("migration at position {0} has an empty id")]
    EmptyId(usize),

    /// A step carries no SQL to execute.
    #[error("migration '{0}' has no statements")]
    NoStatements(&'static str),
}

/// An ordered, validated list of migration steps.
///
/// Construction is the only point where steps are checked; once built the
/// registry is read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    steps: Vec<Step>,
}

impl Registry {
    /// Validates `steps` and wraps them in application order.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if an id is empty or repeated, or if a step
    /// has no statements.
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Result<Self, RegistryError> {
        let steps: Vec<Step> = steps.into_iter().collect();
        let mut seen = HashSet::with_capacity(steps.len());

        for (position, step) in steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(RegistryError::EmptyId(position));
            }
            if step.statements.is_empty() {
                return Err(RegistryError::NoStatements(step.id));
            }
            if !seen.insert(step.id) {
                return Err(RegistryError::DuplicateId(step.id));
            }
        }

        Ok(Self { steps })
    }

    /// The registry built from [`BUILTIN_STEPS`].
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(BUILTIN_STEPS.iter().copied())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Looks up a step by id.
    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_valid() {
        let registry = Registry::builtin().expect("builtin registry should be valid");
        assert_eq!(registry.len(), 9);

        let ids: Vec<&str> = registry.iter().map(|step| step.id).collect();
        assert_eq!(ids.first(), Some(&"create_customer_name_watches"));
        assert_eq!(
            ids.last(),
            Some(&"add__denied_persons__to__ofac_download_stats")
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = Registry::new([
            Step::new("create_a", &["CREATE TABLE a (id INTEGER);"]),
            Step::new("create_b", &["CREATE TABLE b (id INTEGER);"]),
            Step::new("create_a", &["CREATE TABLE a2 (id INTEGER);"]),
        ])
        .expect_err("duplicate id should be rejected");

        assert_eq!(err, RegistryError::DuplicateId("create_a"));
    }

    #[test]
    fn empty_id_and_empty_statements_are_rejected() {
        let err = Registry::new([Step::new(" ", &["SELECT 1;"])])
            .expect_err("blank id should be rejected");
        assert_eq!(err, RegistryError::EmptyId(0));

        let err = Registry::new([Step::new("noop", &[])])
            .expect_err("step without statements should be rejected");
        assert_eq!(err, RegistryError::NoStatements("noop"));
    }

    #[test]
    fn registry_preserves_insertion_order() {
        let registry = Registry::new([
            Step::new("b", &["SELECT 1;"]),
            Step::new("a", &["SELECT 1;"]),
            Step::new("c", &["SELECT 1;"]),
        ])
        .expect("registry should be valid");

        let ids: Vec<&str> = (&registry).into_iter().map(|step| step.id).collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert_eq!(registry.get("a").map(|step| step.id), Some("a"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn checksum_tracks_statement_content() {
        let original = Step::new("s", &["CREATE TABLE t (id INTEGER);"]);
        let same = Step::new("s", &["CREATE TABLE t (id INTEGER);"]);
        let edited = Step::new("s", &["CREATE TABLE t (id TEXT);"]);
        let split = Step::new("s", &["CREATE TABLE t", "(id INTEGER);"]);

        assert_eq!(original.checksum(), same.checksum());
        assert_ne!(original.checksum(), edited.checksum());
        assert_ne!(original.checksum(), split.checksum());
        assert_eq!(original.checksum().len(), 64);
    }
}
