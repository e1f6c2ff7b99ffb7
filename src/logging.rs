use crate::{ACTION_TARGET, CONSOLE_TARGET, ERROR_TARGET};
use std::fmt::Display;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log directory name
pub const LOG_DIR: &str = "logs";
/// Enforcement log file name
pub const ENFORCER_LOG_FILE: &str = "enforcer";

/// Initialize the logging system with console and file outputs
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for the life of the process.
pub fn init(log_dir: &Path) -> Result<WorkerGuard, Box<dyn std::error::Error + Send + Sync>> {
    // Create log directory if it doesn't exist
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    // Set up file appender with daily rotation
    let enforcer_file = RollingFileAppender::new(Rotation::DAILY, log_dir, ENFORCER_LOG_FILE);
    let (enforcer_writer, guard) = tracing_appender::non_blocking(enforcer_file);

    // Create a layer for console output (human-readable format)
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // Create a layer for enforcement logs (JSON format)
    let enforcer_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(enforcer_writer);

    // Default to INFO level if not specified, but keep the HTTP stack quiet
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive("reqwest=warn".parse()?)
            .add_directive("hyper=warn".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(enforcer_layer)
        .try_init()?;

    info!("Logging system initialized");
    Ok(guard)
}

/// Log the start of a manual action and return its start time
pub fn log_action_start(action: &str, user_id: u64) -> Instant {
    info!(
        target: ACTION_TARGET,
        action = %action,
        user_id = user_id,
        event = "start",
        "Action started"
    );
    Instant::now()
}

/// Log the end of a manual action
pub fn log_action_end(action: &str, user_id: u64, started: Instant) {
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or_default();
    info!(
        target: ACTION_TARGET,
        action = %action,
        user_id = user_id,
        duration_ms = duration_ms,
        event = "end",
        "Action completed"
    );
}

/// Log a manual action that failed
pub fn log_action_error(action: &str, user_id: u64, error: &impl Display) {
    error!(
        target: ERROR_TARGET,
        action = %action,
        user_id = user_id,
        error = %error,
        "Action failed"
    );
}

pub fn log_console(message: impl Display) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}
