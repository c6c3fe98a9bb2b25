//! Tracing/logging bootstrap.
//!
//! Console output is env-filtered (`RUST_LOG`, default `info`); when a log
//! directory is given, a daily-rolling file sink is added under it. `log`
//! macros from dependencies are bridged into tracing by the subscriber.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initialize global logging. Returns the file writer guard, which must be
/// held for the lifetime of the process when a log directory is used.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pocketpaw.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            None
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init(None);
        let second = init(None);
        assert!(first.is_none());
        assert!(second.is_none());
    }
}
