//! `ofac-migrate`: bootstraps the OFAC database and reports its schema state.
//!
//! Loads configuration, initialises structured logging, connects (which
//! applies any pending migrations), and logs the state of every registered
//! step. Exits non-zero if any stage fails.

mod config;

use std::process::ExitCode;

use ofac_db::{ConnectError, Registry};
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("OFAC_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn run(config: &config::Config) -> Result<(), ConnectError> {
    let registry = Registry::builtin()?;
    let pool = ofac_db::Bootstrapper::new(config.database.connection_config(), registry.clone())
        .connect()?;

    let conn = pool.get().map_err(ConnectError::Checkout)?;
    for step in ofac_db::status(&conn, &registry)? {
        match step.applied_at {
            Some(applied_at) if step.checksum_drift => tracing::warn!(
                migration = step.id,
                %applied_at,
                "applied, but statements changed since"
            ),
            Some(applied_at) => tracing::info!(migration = step.id, %applied_at, "applied"),
            None => tracing::warn!(migration = step.id, "pending"),
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    match run(&config) {
        Ok(()) => {
            tracing::info!(database = %config.database.name, "database is up to date");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "database bootstrap failed");
            ExitCode::FAILURE
        }
    }
}
