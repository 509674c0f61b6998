//! Tracing subscriber initialization.
//!
//! Console logs go to stderr in the configured format. A second, plain-text
//! layer writes to the campaign log file, which only becomes known once the
//! instrument has reported its file name; until a file is attached that layer
//! discards its output.
//!
//! # Filter priority (highest to lowest)
//!
//! 1. `--log` CLI flag
//! 2. `RUST_LOG` env var
//! 3. `logging.level` from the configuration

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSettings};
use crate::error::{ScanError, ScanResult};

/// A log file that can be attached after the subscriber is installed.
#[derive(Clone, Default)]
pub struct DeferredFile {
    inner: Arc<Mutex<Option<File>>>,
}

impl DeferredFile {
    /// A file slot with nothing attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start appending log output to `path`.
    pub fn attach(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.inner.lock() = Some(file);
        Ok(())
    }

    /// Flush and close the current file, if any.
    pub fn detach(&self) {
        if let Some(mut file) = self.inner.lock().take() {
            let _ = file.flush();
        }
    }

    /// Whether a file is currently attached.
    pub fn is_attached(&self) -> bool {
        self.inner.lock().is_some()
    }
}

/// Writer handed out per event by [`DeferredFile`].
pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFile {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Build the filter from the CLI override, `RUST_LOG` or the configured level.
pub fn build_env_filter(settings: &LoggingSettings, cli_level: Option<&str>) -> EnvFilter {
    if let Some(filter) = cli_level.and_then(|level| EnvFilter::try_new(level).ok()) {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(&settings.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber and return the handle of the file layer.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(settings: &LoggingSettings, cli_level: Option<&str>) -> ScanResult<DeferredFile> {
    let file = DeferredFile::new();
    let filter = build_env_filter(settings, cli_level);

    let console = match settings.format {
        LogFormat::Full => fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(settings.ansi)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(settings.ansi)
            .compact()
            .boxed(),
        LogFormat::Json => fmt::layer().with_writer(io::stderr).json().boxed(),
    };
    let file_layer = fmt::layer().with_writer(file.clone()).with_ansi(false);

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .try_init()
        .map_err(|e| ScanError::Configuration(format!("failed to install logger: {e}")))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_discarded_until_attached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.log");
        let file = DeferredFile::new();

        file.make_writer().write_all(b"dropped\n").unwrap();
        assert!(!path.exists());

        file.attach(&path).unwrap();
        assert!(file.is_attached());
        file.make_writer().write_all(b"kept\n").unwrap();
        file.detach();
        file.make_writer().write_all(b"dropped again\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept\n");
    }

    #[test]
    fn test_cli_level_wins() {
        let settings = LoggingSettings::default();
        let filter = build_env_filter(&settings, Some("debug"));
        assert_eq!(filter.to_string(), "debug");
    }
}
