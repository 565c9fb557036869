pub mod aggregation;
pub mod allocation;
pub mod cache;
pub mod commands;
pub mod completion;
pub mod db;
pub mod errors;
pub mod models;
pub mod period;
pub mod scope;
pub mod service;
pub mod views;

pub use crate::commands::{AppState, ClientError, CommandResult};
pub use crate::errors::{AppError, AppResult, FieldError};
pub use crate::models::{CallerContext, MetricSet, PartialMetricSet, Role, SubjectType, Target};
pub use crate::period::{Period, PeriodInput, Quarter, TargetKind};
pub use crate::service::TargetService;

use crate::db::Database;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Opens the target store under `data_dir`, applying `targets.yaml` from the same
/// directory when present, and installs file logging.
pub fn bootstrap(data_dir: &Path) -> AppResult<AppState> {
    std::fs::create_dir_all(data_dir)?;
    if let Err(error) = init_tracing(data_dir) {
        eprintln!("failed to initialize tracing: {}", error);
    }

    let db = Arc::new(Database::new(&data_dir.join(service::DATABASE_FILE))?);
    let overrides = data_dir.join("targets.yaml");
    if overrides.exists() {
        let settings = db.apply_settings_file(&overrides)?;
        tracing::info!(
            min_year = settings.min_year,
            max_year = settings.max_year,
            cache_ttl_seconds = settings.statistics_cache_ttl_seconds,
            "applied target settings overrides"
        );
    }
    let service = TargetService::from_database(db)?;
    tracing::info!(path = %service.database().path().display(), "target store ready");
    Ok(AppState::new(service))
}

pub fn init_tracing(data_dir: &Path) -> Result<(), String> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "targets.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
