//! Tracing subscriber setup for the daemon binary.

use std::io::IsTerminal;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

/// Log file name prefix inside `daemon.log_dir`.
const LOG_FILE_PREFIX: &str = "ptybridge";

/// Keeps the file writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Level used when `RUST_LOG` is not set.
pub fn default_directive(level: &str, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        level.to_lowercase()
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `level` and `verbose`. With `log_dir`
/// set, events also go to a daily-rotated file there.
pub fn init(level: &str, verbose: bool, log_dir: Option<&Path>) -> LoggingGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level, verbose)));

    let (writer, guard, ansi) = match log_dir.map(open_rolling_file) {
        Some(Ok(appender)) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (
                BoxMakeWriter::new(std::io::stderr.and(non_blocking)),
                Some(guard),
                false,
            )
        }
        Some(Err(err)) => {
            eprintln!("Warning: file logging disabled: {err}");
            (BoxMakeWriter::new(std::io::stderr), None, true)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, true),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(ansi && std::io::stderr().is_terminal())
        .with_writer(writer);

    if subscriber.try_init().is_err() {
        return LoggingGuard { _file: None };
    }

    LoggingGuard { _file: guard }
}

fn open_rolling_file(dir: &Path) -> Result<RollingFileAppender, String> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| format!("{}: {}", dir.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("warn", false), "warn");
        assert_eq!(default_directive("WARN", false), "warn");
        assert_eq!(default_directive("warn", true), "debug");
    }

    #[test]
    fn test_rolling_file_created_in_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(open_rolling_file(dir.path()).is_ok());
    }
}
