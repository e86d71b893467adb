use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ofac_db::{ConnectError, ConnectOptions, Registry, Step, BUILTIN_STEPS};
use ofac_testdb::{
    Instance, InstanceRuntime, ProvisionError, ProvisionRequest, Provisioner, RetryPolicy,
    RuntimeError, TempDirRuntime, TestDatabase,
};

/// Runtime whose instance directory only appears after a delay, standing in
/// for a server that takes a while to accept connections.
struct SlowRuntime {
    root: PathBuf,
    ready_after: Option<Duration>,
    teardowns: Arc<AtomicUsize>,
}

struct SlowInstance {
    address: PathBuf,
    teardowns: Arc<AtomicUsize>,
    torn_down: bool,
}

impl InstanceRuntime for SlowRuntime {
    fn provision(&self, _request: &ProvisionRequest) -> Result<Box<dyn Instance>, RuntimeError> {
        let address = self.root.join("instance");
        if let Some(delay) = self.ready_after {
            let dir = address.clone();
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                std::fs::create_dir_all(dir).expect("failed to create instance dir");
            });
        }
        Ok(Box::new(SlowInstance {
            address,
            teardowns: self.teardowns.clone(),
            torn_down: false,
        }))
    }
}

impl Instance for SlowInstance {
    fn address(&self) -> &Path {
        &self.address
    }

    fn teardown(&mut self) -> Result<(), RuntimeError> {
        if !self.torn_down {
            self.torn_down = true;
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct FailingRuntime;

impl InstanceRuntime for FailingRuntime {
    fn provision(&self, _request: &ProvisionRequest) -> Result<Box<dyn Instance>, RuntimeError> {
        Err(RuntimeError::Io(std::io::Error::other("runtime unavailable")))
    }
}

#[test]
fn provision_returns_fully_migrated_database() {
    let mut db = Provisioner::new()
        .provision()
        .expect("provisioning should succeed");
    let address = db.address().expect("instance should be open").to_path_buf();

    {
        let conn = db.pool().expect("pool should be open").get().expect("failed to get connection");
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM _ofac_migrations", [], |row| row.get(0))
            .expect("failed to count tracker rows");
        assert_eq!(applied as usize, BUILTIN_STEPS.len());

        conn.execute(
            "INSERT INTO ofac_download_stats (downloaded_at, sdns, alt_names, addresses, denied_persons)
             VALUES ('2019-01-01T00:00:00Z', 1, 2, 3, 4)",
            [],
        )
        .expect("schema should be at the latest step");
    }

    db.close().expect("first close should succeed");
    assert!(db.is_closed());
    assert!(db.pool().is_none());
    assert!(!address.exists(), "instance directory should be removed");

    db.close().expect("second close should be a no-op");
}

#[test]
fn each_provision_starts_from_an_empty_database() {
    let first = TestDatabase::create();
    first
        .pool()
        .expect("pool should be open")
        .get()
        .expect("failed to get connection")
        .execute(
            "INSERT INTO webhook_stats (watch_id, attempted_at, status) VALUES ('w1', 'now', 'ok')",
            [],
        )
        .expect("failed to insert");

    let second = TestDatabase::create();
    let rows: i64 = second
        .pool()
        .expect("pool should be open")
        .get()
        .expect("failed to get connection")
        .query_row("SELECT COUNT(*) FROM webhook_stats", [], |row| row.get(0))
        .expect("failed to count rows");
    assert_eq!(rows, 0);
    assert_ne!(first.address(), second.address());
}

#[test]
fn drop_tears_down_instance() {
    let root = tempfile::tempdir().expect("failed to create root dir");
    let db = Provisioner::with_runtime(TempDirRuntime::in_dir(root.path()))
        .provision()
        .expect("provisioning should succeed");
    let address = db.address().expect("instance should be open").to_path_buf();
    assert!(address.exists());

    drop(db);
    assert!(!address.exists());
}

#[test]
fn readiness_poll_waits_for_slow_instance() {
    let root = tempfile::tempdir().expect("failed to create root dir");
    let teardowns = Arc::new(AtomicUsize::new(0));
    let runtime = SlowRuntime {
        root: root.path().to_path_buf(),
        ready_after: Some(Duration::from_millis(50)),
        teardowns: teardowns.clone(),
    };

    let registry = Registry::new([Step::new(
        "create_probe",
        &["CREATE TABLE IF NOT EXISTS probe (id INTEGER PRIMARY KEY);"],
    )])
    .expect("registry should be valid");

    let mut db = Provisioner::with_runtime(runtime)
        .retry(RetryPolicy::fixed(200, Duration::from_millis(10)))
        .registry(registry)
        .provision()
        .expect("instance should become ready");

    let conn = db.pool().expect("pool should be open").get().expect("failed to get connection");
    conn.execute("INSERT INTO probe DEFAULT VALUES", [])
        .expect("custom registry should be applied");
    drop(conn);

    db.close().expect("close should succeed");
    db.close().expect("second close should be a no-op");
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn unreachable_instance_is_torn_down_after_retry_budget() {
    let root = tempfile::tempdir().expect("failed to create root dir");
    let teardowns = Arc::new(AtomicUsize::new(0));
    let runtime = SlowRuntime {
        root: root.path().to_path_buf(),
        ready_after: None,
        teardowns: teardowns.clone(),
    };

    let err = Provisioner::with_runtime(runtime)
        .retry(RetryPolicy::fixed(3, Duration::from_millis(5)))
        .options(ConnectOptions {
            connect_timeout: Duration::from_millis(200),
            ..ConnectOptions::default()
        })
        .provision()
        .expect_err("instance never becomes reachable");

    match err {
        ProvisionError::NotReady { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error type: {other:?}"),
    }
    assert_eq!(teardowns.load(Ordering::SeqCst), 1, "instance should be released");
}

#[test]
fn runtime_failure_is_reported() {
    let err = Provisioner::with_runtime(FailingRuntime)
        .provision()
        .expect_err("runtime failure should be fatal");
    assert!(matches!(err, ProvisionError::Runtime(_)), "unexpected error: {err:?}");
}

#[test]
fn failed_migration_tears_down_instance() {
    let root = tempfile::tempdir().expect("failed to create root dir");
    let teardowns = Arc::new(AtomicUsize::new(0));
    let runtime = SlowRuntime {
        root: root.path().to_path_buf(),
        ready_after: Some(Duration::ZERO),
        teardowns: teardowns.clone(),
    };

    let registry = Registry::new([
        Step::new(
            "create_probe",
            &["CREATE TABLE IF NOT EXISTS probe (id INTEGER PRIMARY KEY);"],
        ),
        Step::new("broken", &["CREATE TABLE broken ("]),
    ])
    .expect("registry should be valid");

    let err = Provisioner::with_runtime(runtime)
        .retry(RetryPolicy::fixed(200, Duration::from_millis(10)))
        .registry(registry)
        .provision()
        .expect_err("broken step should fail provisioning");

    assert!(
        matches!(err, ProvisionError::Bootstrap(ConnectError::Migration(_))),
        "unexpected error: {err:?}"
    );
    assert_eq!(teardowns.load(Ordering::SeqCst), 1, "instance should be released");
}
