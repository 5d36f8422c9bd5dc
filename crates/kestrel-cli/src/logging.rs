//! Logging setup.
//!
//! Two layers share one subscriber. The console layer prints everything the
//! `EnvFilter` lets through, as text on standard error or as JSON into the
//! `--log` file. The internal layer only takes events on the
//! `kestrel::internal` target and writes them to the internal log.

use anyhow::{Context, Result};
use kestrel_common::config::FALLBACK_INTERNAL_LOG;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::filter::{EnvFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Target for diagnostics that go to the internal log.
pub const INTERNAL_TARGET: &str = "kestrel::internal";

pub struct LogOptions<'a> {
    pub debug: bool,
    pub quiet: bool,
    pub server_log: Option<&'a Path>,
    pub internal_log: &'a Path,
}

/// Open internal log file.
#[derive(Debug, Clone)]
pub struct InternalLog {
    file: Arc<File>,
    path: PathBuf,
}

impl InternalLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> kestrel_common::Result<()> {
        (&*self.file).flush()?;
        Ok(())
    }
}

/// Opens `configured` for appending, or `fallback` if that fails.
///
/// Returns the log and, when the fallback was used, the error that caused it.
///
/// # Errors
///
/// Returns an error if neither file can be opened.
pub fn open_internal_log(configured: &Path, fallback: &Path) -> Result<(InternalLog, Option<io::Error>)> {
    match append(configured) {
        Ok(file) => Ok((
            InternalLog {
                file: Arc::new(file),
                path: configured.to_path_buf(),
            },
            None,
        )),
        Err(first) => {
            let file = append(fallback).with_context(|| {
                format!(
                    "Could not open internal log {} ({}) or {}",
                    configured.display(),
                    first,
                    fallback.display()
                )
            })?;
            Ok((
                InternalLog {
                    file: Arc::new(file),
                    path: fallback.to_path_buf(),
                },
                Some(first),
            ))
        }
    }
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn console_filter(debug: bool) -> Result<EnvFilter> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    Ok(filter.add_directive(format!("{}=off", INTERNAL_TARGET).parse()?))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if a log file cannot be opened or a subscriber is
/// already installed.
pub fn init(options: &LogOptions<'_>) -> Result<InternalLog> {
    let (internal, fell_back) = open_internal_log(options.internal_log, Path::new(FALLBACK_INTERNAL_LOG))?;
    let filter = console_filter(options.debug)?;

    let console = match options.server_log {
        Some(path) => {
            let file = append(path).with_context(|| format!("Could not open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_filter(filter)
                    .boxed(),
            )
        }
        None if options.quiet => None,
        None => Some(fmt::layer().with_writer(io::stderr).with_filter(filter).boxed()),
    };

    let internal_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(internal.file.clone())
        .with_filter(Targets::new().with_target(INTERNAL_TARGET, Level::TRACE));

    tracing_subscriber::registry()
        .with(console)
        .with(internal_layer)
        .try_init()
        .context("Could not initialize logging")?;

    if let Some(err) = fell_back {
        tracing::warn!(
            target: "kestrel::internal",
            error = %err,
            "Could not open {}, using {}",
            options.internal_log.display(),
            internal.path().display()
        );
    }

    Ok(internal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_internal_log_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let configured = dir.path().join("internal.log");
        let fallback = dir.path().join("fallback.log");

        let (log, fell_back) = open_internal_log(&configured, &fallback).unwrap();

        assert_eq!(log.path(), configured);
        assert!(fell_back.is_none());
        assert!(!fallback.exists());
        log.flush().unwrap();
    }

    #[test]
    fn test_internal_log_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("fallback.log");

        let (log, fell_back) = open_internal_log(&dir.path().join("no/such/dir.log"), &fallback).unwrap();

        assert_eq!(log.path(), fallback);
        assert!(fell_back.is_some());
        assert!(fallback.exists());
    }

    #[test]
    fn test_internal_log_fails_when_both_targets_fail() {
        let dir = tempfile::tempdir().unwrap();
        let result = open_internal_log(&dir.path().join("a/b.log"), &dir.path().join("c/d.log"));
        assert!(result.is_err());
    }

    #[test]
    fn test_console_filter_hides_internal_target() {
        let filter = console_filter(true).unwrap().to_string();
        assert!(filter.contains("kestrel::internal=off"));
        assert!(filter.contains("debug"));
    }
}
