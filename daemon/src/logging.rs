//! Log output.
//!
//! Every line goes to stderr (the log file, once daemonized) until
//! [`switch_to_syslog`] is called, after which it goes to syslog instead.
use std::ffi::{CStr, CString};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d @ %H:%M:%S";

const SYSLOG_IDENT: &CStr = c"kfmon";

static USE_SYSLOG: AtomicBool = AtomicBool::new(false);

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Sink)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))
}

/// Sends every subsequent line to syslog, as `kfmon[pid]` in the daemon facility.
pub fn switch_to_syslog() {
    // SAFETY: `SYSLOG_IDENT` is 'static, as openlog requires.
    unsafe {
        libc::openlog(
            SYSLOG_IDENT.as_ptr(),
            libc::LOG_CONS | libc::LOG_PID | libc::LOG_NDELAY,
            libc::LOG_DAEMON,
        )
    };
    USE_SYSLOG.store(true, Ordering::Release);
}

fn syslog_enabled() -> bool {
    USE_SYSLOG.load(Ordering::Acquire)
}

fn timestamp(now: chrono::DateTime<chrono::Local>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Local wall-clock time. Left out on syslog, which stamps lines itself.
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        if syslog_enabled() {
            return Ok(());
        }
        write!(w, "[{}]", timestamp(chrono::Local::now()))
    }
}

fn priority(level: Level) -> libc::c_int {
    match level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        _ => libc::LOG_DEBUG,
    }
}

#[derive(Debug, Clone, Copy)]
struct Sink;

impl<'a> MakeWriter<'a> for Sink {
    type Writer = Line;

    fn make_writer(&'a self) -> Line {
        Line::new(Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Line {
        Line::new(*meta.level())
    }
}

/// One formatted event, emitted in a single write when dropped.
struct Line {
    level: Level,
    buf: Vec<u8>,
}

impl Line {
    fn new(level: Level) -> Self {
        Self { level, buf: Vec::new() }
    }
}

impl Write for Line {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Line {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if syslog_enabled() {
            write_syslog(self.level, &self.buf);
        } else {
            let _ = io::stderr().write_all(&self.buf);
        }
    }
}

fn syslog_message(line: &[u8]) -> Option<CString> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    CString::new(text.replace('\0', "")).ok()
}

fn write_syslog(level: Level, line: &[u8]) {
    let Some(msg) = syslog_message(line) else {
        return;
    };
    // SAFETY: fixed "%s" format with a NUL-terminated argument.
    unsafe { libc::syslog(priority(level), c"%s".as_ptr(), msg.as_ptr()) };
}
