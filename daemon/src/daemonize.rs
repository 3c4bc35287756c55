/// Detaching from whatever launched us.
///
/// We're usually started from a udev rule or an init script, with a negative
/// nice value and stdio pointing somewhere we don't want to keep.
/// [`daemonize`] does the classic double fork and leaves stderr on our own
/// log file; [`SavedStdio`] keeps the original streams for our children.
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
use tracing::warn;

use crate::process_monitor::SavedStdio;

/// The log file is truncated on startup once it grows past this.
pub const LOG_SIZE_LIMIT: u64 = 1024 * 1024;

const DEV_NULL: &str = "/dev/null";

/// Puts us back at the default scheduling priority.
pub fn reset_priority() {
    // SAFETY: plain syscall on our own process.
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 0) } == -1 {
        warn!("setpriority: {}", std::io::Error::last_os_error());
    }
}

/// Forks into the background, detaches from the controlling terminal, and
/// redirects stdio: stdin/stdout to `/dev/null`, stderr to `log_file`.
///
/// Returns copies of the streams we had before the redirection.
pub fn daemonize(log_file: &Path) -> Result<SavedStdio> {
    fork_and_exit_parent().context("First fork failed")?;
    setsid().context("setsid failed")?;
    // SAFETY: ignoring a signal installs no handler code.
    unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }.context("Failed to ignore SIGHUP")?;
    // Not a session leader anymore, so we can never reacquire a terminal.
    fork_and_exit_parent().context("Second fork failed")?;

    chdir("/").context("chdir / failed")?;
    let _ = umask(Mode::empty());

    let stdio = SavedStdio::capture().context("Failed to save the original stdio")?;

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open(DEV_NULL)
        .with_context(|| format!("Failed to open {DEV_NULL}"))?;
    redirect(&null, libc::STDIN_FILENO)?;
    redirect(&null, libc::STDOUT_FILENO)?;

    let log = open_log(log_file)?;
    redirect(&log, libc::STDERR_FILENO)?;

    Ok(stdio)
}

/// Points stderr at `/dev/null`, once logging goes through syslog.
pub fn silence_stderr() -> Result<()> {
    let null = OpenOptions::new()
        .write(true)
        .open(DEV_NULL)
        .with_context(|| format!("Failed to open {DEV_NULL}"))?;
    redirect(&null, libc::STDERR_FILENO)
}

fn fork_and_exit_parent() -> Result<()> {
    // SAFETY: nothing but the main thread is running yet.
    match unsafe { fork() }? {
        // SAFETY: the parent leaves without running atexit handlers or
        // flushing stdio buffers the child also owns.
        ForkResult::Parent { .. } => unsafe { libc::_exit(0) },
        ForkResult::Child => Ok(()),
    }
}

fn redirect(file: &File, target: libc::c_int) -> Result<()> {
    dup2(file.as_raw_fd(), target).with_context(|| format!("dup2 onto fd {target} failed"))?;
    Ok(())
}

/// Opens `path` for appending (mode 0600 if created), truncating it first if
/// it's over [`LOG_SIZE_LIMIT`].
pub(crate) fn open_log(path: &Path) -> Result<File> {
    let oversized = std::fs::metadata(path).map(|m| m.len() > LOG_SIZE_LIMIT).unwrap_or(false);
    if oversized {
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to truncate {}", path.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}
