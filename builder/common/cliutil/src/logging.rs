use std::{fs::File, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// A guard object to keep the logging backend alive for the program's
/// lifetime.
pub struct LogGuard {
    _span_guard: tracing::span::EnteredSpan,
}

/// The configuration for the logger.
///
/// Console output honours `RUST_LOG` and falls back to INFO (DEBUG with
/// `verbose`). The optional log file always records DEBUG so that per-step
/// diagnostics stay complete regardless of console verbosity.
pub struct LoggingConfig {
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn setup(&self) -> Result<LogGuard> {
        let console_level = if self.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .without_time()
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(console_level.into())
                    .from_env_lossy(),
            );

        let file_layer = match &self.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = File::create(path)
                    .with_context(|| format!("Cannot create log file {}", path.display()))?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file))
                        .with_filter(LevelFilter::DEBUG),
                )
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .init();

        let span = tracing::info_span!("cli", process = crate::get_current_process_name());
        Ok(LogGuard {
            _span_guard: span.entered(),
        })
    }
}
