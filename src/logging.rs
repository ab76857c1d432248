//! Logging setup
//!
//! Console output for humans plus a daily-rotated JSON file under
//! `~/.voicegate/logs/` for later analysis. Audio content is never logged,
//! only levels, durations and outcomes.

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::runtime::CallSummary;

/// Held for the life of the process so buffered file logs are flushed on exit
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn console_filter(verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn console_layer<S>(verbose: bool) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(console_filter(verbose))
}

/// Install the global subscriber. Falls back to console-only output when the
/// log directory cannot be created.
pub fn init_logging(verbose: bool) {
    let log_dir = match log_directory() {
        Some(dir) => match std::fs::create_dir_all(&dir) {
            Ok(()) => Some(dir),
            Err(e) => {
                eprintln!("Could not create log directory {}: {}", dir.display(), e);
                None
            }
        },
        None => None,
    };

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(console_layer(verbose))
            .init();
        warn!("File logging disabled, logging to console only");
        return;
    };

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "voicegate.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(non_blocking)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(EnvFilter::new("voice_gate=debug,info"));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer(verbose))
        .init();

    info!(
        event = "logging_initialized",
        log_dir = %log_dir.display(),
        "Logging initialized"
    );
}

fn log_directory() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".voicegate").join("logs"))
}

pub fn log_call_summary(summary: &CallSummary) {
    info!(
        event = "call_summary",
        utterances = summary.session.utterances,
        spurious_triggers = summary.session.spurious_triggers,
        speech_ms = summary.session.speech_ms,
        sent = summary.dispatch.sent,
        failed = summary.dispatch.failed,
        dropped = summary.dispatch.dropped,
        "Call ended"
    );
}
