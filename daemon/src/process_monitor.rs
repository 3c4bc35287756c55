//! Spawning actions and reaping them without a `SIGCHLD` handler.
//!
//! Every child gets the write end of a fresh pipe, which it keeps until it
//! exits. The read end sits in the process table and is polled by the event
//! loop: once it reads EOF/hang-up, the child is gone and `waitpid` won't block.
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvp, fork, pipe, ForkResult, Pid};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::event::Launcher;
use crate::process_table::ProcessTable;

/// Copies of the daemon's original stdin/stdout/stderr, taken before they
/// were redirected, so children get the streams we were started with.
#[derive(Debug)]
pub struct SavedStdio {
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
}

impl SavedStdio {
    /// Duplicates the current standard streams. The copies are close-on-exec;
    /// `dup2` onto 0/1/2 in the child clears that flag for the real ones.
    pub fn capture() -> std::io::Result<Self> {
        Ok(Self {
            stdin: std::io::stdin().as_fd().try_clone_to_owned()?,
            stdout: std::io::stdout().as_fd().try_clone_to_owned()?,
            stderr: std::io::stderr().as_fd().try_clone_to_owned()?,
        })
    }
}

/// Forks and execs `argv`, registering the child in `table` under `watch`.
///
/// Fails if the table is full, or if `pipe`/`fork` fail. If `exec` itself
/// fails, the child reports it on the original stderr and exits 1.
pub fn spawn(table: &mut ProcessTable, stdio: &SavedStdio, argv: &[CString], watch: usize) -> Result<Pid> {
    let slot = table.allocate().ok_or(Error::ProcessTableFull)?;
    let program = argv.first().ok_or(Error::Sys {
        op: "execvp",
        source: Errno::EINVAL,
    })?;

    let (read_end, write_end) = pipe().map_err(Error::sys("pipe"))?;
    // Later children must not inherit this child's read end.
    fcntl(read_end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::sys("fcntl"))?;

    // SAFETY: the daemon is single-threaded; the child only rewires its fds
    // and signal dispositions before exec'ing or exiting.
    match unsafe { fork() }.map_err(Error::sys("fork"))? {
        ForkResult::Child => {
            drop(read_end);
            let _ = dup2(stdio.stdin.as_raw_fd(), libc::STDIN_FILENO);
            let _ = dup2(stdio.stdout.as_raw_fd(), libc::STDOUT_FILENO);
            let _ = dup2(stdio.stderr.as_raw_fd(), libc::STDERR_FILENO);
            // SAFETY: restoring default dispositions is always sound. SIGPIPE
            // is ignored by the Rust runtime and that would leak into the child.
            unsafe {
                let _ = signal(Signal::SIGHUP, SigHandler::SigDfl);
                let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
            }
            // `write_end` stays open across exec: it is closed when the child exits.
            let Err(e) = execvp(program, argv);
            // Raw write: the stderr lock may have been held by another thread at fork time.
            let msg = format!("[kfmon] execvp {}: {e}\n", program.to_string_lossy());
            // SAFETY: `msg` outlives the call and the length matches.
            unsafe { libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len()) };
            drop(write_end);
            // SAFETY: skip atexit handlers and buffered state owned by the parent.
            unsafe { libc::_exit(libc::EXIT_FAILURE) }
        }
        ForkResult::Parent { child } => {
            drop(write_end);
            table.register(slot, child, read_end, watch);
            info!("Spawned process {child} for watch idx {watch}");
            debug!("Assigned pid {child} to process table entry idx {slot}");
            Ok(child)
        }
    }
}

fn log_exit(pid: Pid, status: WaitStatus, what: &str) {
    match status {
        WaitStatus::Exited(_, code) => info!("{what} process {pid}: It exited with status {code}."),
        WaitStatus::Signaled(_, sig, _) => {
            info!("{what} process {pid}: It was killed by signal {} ({sig}).", sig as i32)
        }
        other => debug!("{what} process {pid}: {other:?}"),
    }
}

/// Owns the process table and everything needed to fill and drain it.
#[derive(Debug)]
pub struct Supervisor {
    table: ProcessTable,
    stdio: SavedStdio,
}

impl Supervisor {
    pub fn new(table: ProcessTable, stdio: SavedStdio) -> Self {
        Self { table, stdio }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    /// Waits for the child in `slot`, whose pipe has already signalled, and
    /// frees its slot.
    pub fn reap(&mut self, slot: usize) -> Result<()> {
        let Some(pid) = self.table.get(slot).map(|child| child.pid) else {
            return Ok(());
        };
        info!(". . . Reaping process {pid}");
        let status = loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                other => break other.map_err(Error::sys("waitpid"))?,
            }
        };
        log_exit(pid, status, "Reaped");
        self.table.release(slot);
        Ok(())
    }

    /// Non-blocking sweep over every tracked child, for the ones whose pipe
    /// never signalled (e.g. a grandchild kept the write end open).
    pub fn reap_stale(&mut self) -> Result<()> {
        if self.table.is_empty() {
            return Ok(());
        }
        let tracked: Vec<(usize, Pid)> = self.table.occupied().map(|(slot, child)| (slot, child.pid)).collect();
        for (slot, pid) in tracked {
            debug!("Forcefully trying to reap process {pid} ...");
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => debug!("... process {pid} is still alive."),
                Ok(status) => {
                    log_exit(pid, status, "Reaped zombie");
                    self.table.release(slot);
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    error!("waitpid on tracked process {pid} failed: {e}");
                    return Err(Error::sys("waitpid")(e));
                }
            }
        }
        Ok(())
    }
}

impl Launcher for Supervisor {
    fn spawned_pid(&self, watch: usize) -> Option<Pid> {
        self.table.find_by_watch(watch)
    }

    fn launch(&mut self, action: &Path, watch: usize) -> Result<Pid> {
        let program =
            CString::new(action.as_os_str().as_bytes()).map_err(|_| Error::InvalidAction(action.to_path_buf()))?;
        spawn(&mut self.table, &self.stdio, &[program], watch)
    }
}
