//! Logging configuration and log sinks.

use crate::config::ENV_PREFIX;
use crate::{Error, ErrorCode, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses `pretty` or `json`, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

fn env_key(suffix: &str) -> String {
    format!("{ENV_PREFIX}_{suffix}")
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Log file; stderr when unset.
    pub file: Option<PathBuf>,
    /// Event filter.
    pub filter: EnvFilter,
}

impl LoggingConfig {
    /// Default filter directive.
    pub const DEFAULT_FILTER: &'static str = "pipconnect=info";
    /// Filter directive when verbose output is requested.
    pub const VERBOSE_FILTER: &'static str = "pipconnect=debug";

    /// Reads `PIPCONNECT_LOG_FORMAT`, `PIPCONNECT_LOG_FILE` and `RUST_LOG`.
    ///
    /// `RUST_LOG` wins over `verbose`.
    #[must_use]
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var(env_key("LOG_FORMAT"))
            .ok()
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        let file = std::env::var(env_key("LOG_FILE"))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let fallback = if verbose {
            Self::VERBOSE_FILTER
        } else {
            Self::DEFAULT_FILTER
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
        Self {
            format,
            file,
            filter,
        }
    }

    /// Opens the configured sink: the log file if one is set, else stderr.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming `PIPCONNECT_LOG_FILE` if the file or
    /// its directory cannot be created.
    pub fn make_writer(&self) -> Result<BoxMakeWriter> {
        match &self.file {
            Some(path) => Ok(BoxMakeWriter::new(LogFile::open(path)?)),
            None => Ok(BoxMakeWriter::new(io::stderr)),
        }
    }
}

/// Append-only log file shared by every writer the subscriber makes.
#[derive(Clone)]
struct LogFile(Arc<Mutex<File>>);

impl LogFile {
    /// Opens `path` for appending, creating missing directories.
    fn open(path: &Path) -> Result<Self> {
        let invalid = |e: io::Error| {
            Error::config(
                ErrorCode::OperationFailed,
                format!("{} {} is not writable: {e}", env_key("LOG_FILE"), path.display()),
            )
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(invalid)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(invalid)?;
        Ok(Self(Arc::new(Mutex::new(file))))
    }

    // No tracing here: the writer is the subscriber's own sink.
    fn lock(&self) -> MutexGuard<'_, File> {
        self.0.lock().unwrap_or_else(|poisoned| {
            metrics::counter!("log_file_lock_poison_recovery_total").increment(1);
            poisoned.into_inner()
        })
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFile {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_log_file_appends_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pipconnect.log");
        let mut first = LogFile::open(&path).unwrap();
        first.write_all(b"one\n").unwrap();
        let mut second = LogFile::open(&path).unwrap();
        second.write_all(b"two\n").unwrap();
        second.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_unwritable_log_file_names_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let err = LogFile::open(&blocker.join("pipconnect.log")).err().unwrap();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("PIPCONNECT_LOG_FILE"));
    }
}
