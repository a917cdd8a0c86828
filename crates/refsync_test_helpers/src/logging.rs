//! Log setup for test binaries
//!
//! Test output stays quiet by default. [`capture_logs`] records what the
//! RefSync crates log on the current thread so a test can assert on it.

use refsync_common::sanitizer::LogSanitizer;
use refsync_common::telemetry::{RedactedLine, LOG_TARGETS};
use std::io;
use std::sync::{Arc, Mutex, Once};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static INIT: Once = Once::new();

/// Filter putting the RefSync crates at `level` and everything else at `warn`
pub fn test_directives(level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(LOG_TARGETS.iter().map(|target| format!("{}={}", target, level)));
    directives.join(",")
}

/// Install the process-wide test subscriber once
///
/// Later calls are ignored. `RUST_LOG` wins over `level` when set.
pub fn init_test_logging(level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(test_directives(level)));

        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Only errors reach the test output
pub fn suppress_logs() {
    init_test_logging("error");
}

/// Redacted log lines recorded by [`capture_logs`]
#[derive(Clone, Default)]
pub struct LogCapture {
    lines: Arc<Mutex<Vec<u8>>>,
    sanitizer: Arc<LogSanitizer>,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        let lines = self.lines.lock().unwrap();
        String::from_utf8_lossy(&lines).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }
}

/// Appends to the shared capture buffer
pub struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = RedactedLine<CaptureSink>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactedLine::new(self.sanitizer.clone(), CaptureSink(self.lines.clone()))
    }
}

/// Record RefSync logs at `info` and above on this thread until the guard drops
///
/// `#[tokio::test]` runs on a current-thread runtime, so engine calls awaited
/// in the test body are captured too.
pub fn capture_logs() -> (LogCapture, DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(test_directives("info")))
        .with_writer(capture.clone())
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_cover_every_crate() {
        let directives = test_directives("debug");
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("refsync_store=debug"));
        assert!(directives.contains("refsync_sync=debug"));
    }

    #[test]
    fn test_capture_records_redacted_lines() {
        let (capture, _guard) = capture_logs();
        tracing::info!(target: "refsync_sync", "GET /items?key=secret123");
        tracing::debug!(target: "refsync_sync", "below the capture level");

        assert!(capture.contains("GET /items?key=***"));
        assert!(!capture.contains("secret123"));
        assert!(!capture.contains("below the capture level"));
    }
}
