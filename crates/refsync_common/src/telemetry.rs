//! Logging setup for the RefSync binaries
//!
//! Logs go to stderr so stdout stays free for command output. Every line
//! passes through [`LogSanitizer`] first; request URLs logged by the sync
//! engine or by `reqwest` at debug level would otherwise carry API keys.

use crate::sanitizer::LogSanitizer;
use std::io::{self, Write};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crates whose log level follows `--verbose`
pub const LOG_TARGETS: &[&str] = &["refsync_cli", "refsync_config", "refsync_store", "refsync_sync"];

/// Filter used when `RUST_LOG` is unset
///
/// Quiet runs show RefSync's own lifecycle at `info` and only warnings from
/// dependencies. Verbose runs add per-request detail and the HTTP client's
/// connection events.
pub fn default_directives(verbose: bool) -> String {
    let (base, own) = if verbose { ("info", "debug") } else { ("warn", "info") };
    let mut directives = vec![base.to_string()];
    directives.extend(LOG_TARGETS.iter().map(|target| format!("{}={}", target, own)));
    if verbose {
        directives.push("reqwest=debug".to_string());
        directives.push("hyper=warn".to_string());
    }
    directives.join(",")
}

/// Install the global subscriber
///
/// `RUST_LOG` replaces [`default_directives`] when set. `json_format`
/// switches to one JSON object per line for log shippers.
pub fn init_tracing(verbose: bool, json_format: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let writer = RedactingStderr::new();

    if json_format {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_target(verbose)
                    .compact(),
            )
            .with(env_filter)
            .init();
    }
}

/// `MakeWriter` handing out one [`RedactedLine`] per event
#[derive(Clone)]
pub struct RedactingStderr {
    sanitizer: Arc<LogSanitizer>,
}

impl RedactingStderr {
    pub fn new() -> Self {
        Self {
            sanitizer: Arc::new(LogSanitizer::new()),
        }
    }
}

impl Default for RedactingStderr {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> MakeWriter<'a> for RedactingStderr {
    type Writer = RedactedLine<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactedLine::new(self.sanitizer.clone(), io::stderr())
    }
}

/// Buffers one formatted event and writes it redacted when dropped
pub struct RedactedLine<W: Write> {
    sanitizer: Arc<LogSanitizer>,
    buffer: Vec<u8>,
    inner: W,
}

impl<W: Write> RedactedLine<W> {
    pub fn new(sanitizer: Arc<LogSanitizer>, inner: W) -> Self {
        Self {
            sanitizer,
            buffer: Vec::new(),
            inner,
        }
    }

    fn flush_redacted(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&self.buffer);
        let redacted = self.sanitizer.sanitize(&line);
        self.buffer.clear();
        self.inner.write_all(redacted.as_bytes())?;
        self.inner.flush()
    }
}

impl<W: Write> Write for RedactedLine<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write> Drop for RedactedLine<W> {
    fn drop(&mut self) {
        // Nowhere left to report a failed log write
        let _ = self.flush_redacted();
    }
}
