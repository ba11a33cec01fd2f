pub mod alerts;
pub mod analytics;
pub mod config;
pub mod db;
pub mod errors;
pub mod history;
pub mod models;
pub mod pipeline;

pub use crate::config::PipelineConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::pipeline::PipelineCore;

use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global JSON subscriber. `RUST_LOG` wins over the configured filter.
pub fn init_tracing(config: &PipelineConfig) -> AppResult<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let writer = match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "pipeline.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            non_blocking
        }
        None => {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
            let _ = LOG_GUARD.set(guard);
            non_blocking
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(writer)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
