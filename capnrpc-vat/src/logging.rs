use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    prelude::*,
    EnvFilter,
};

use crate::RpcConfig;

/// Filter used when `RUST_LOG` is unset.
///
/// Envelope bodies are logged at trace level, so `trace_messages` only has an effect
/// if the engine crates are enabled at that level.
pub fn default_filter(config: &RpcConfig) -> String {
    let engine = if config.trace_messages { "trace" } else { "debug" };
    format!("capnrpc_vat={engine},capnrpc_transport={engine},capnrpc_core=debug,warn")
}

/// Log to stderr and to a daily rolling JSON file under `log_dir`.
///
/// Console lines carry the `rpc_connection` span (connection id and peer); the file
/// records the same span as structured fields. Logs are flushed when the returned
/// guard is dropped, so hold it for as long as the vat runs.
pub fn init_logging(
    log_dir: impl AsRef<Path>,
    log_prefix: &str,
    config: &RpcConfig,
) -> anyhow::Result<WorkerGuard> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_prefix)
        .filename_suffix("jsonl")
        .build(log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    let console_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(std::io::stderr);

    let file_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        dir = %log_dir.display(),
        max_questions = config.max_questions,
        "Logging initialized"
    );
    Ok(guard)
}

/// Console-only logging for tests. Safe to call more than once.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(&RpcConfig::default()))),
        )
        .with_test_writer()
        .try_init();
}
