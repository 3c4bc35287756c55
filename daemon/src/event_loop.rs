//! The top-level poller.
//!
//! The outer loop (re)arms every watch on a fresh inotify instance whenever the
//! previous set was torn down. The inner loop waits on that instance and on
//! every spawn's pipe, reaping children and dispatching inotify batches.
use std::convert::Infallible;
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{InitFlags, Inotify};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::EventHandler;
use crate::mount;
use crate::oracle::Oracle;
use crate::paths::DeviceLayout;
use crate::process_monitor::{SavedStdio, Supervisor};
use crate::process_table::ProcessTable;
use crate::watch::{arm_watches, WatchEntry};

/// What woke up a single `poll` call.
#[derive(Debug, Default, PartialEq, Eq)]
struct Readiness {
    inotify: bool,
    /// Process table slots whose pipe hung up or turned readable.
    children: Vec<usize>,
}

pub struct Daemon {
    layout: DeviceLayout,
    watches: Vec<WatchEntry>,
    oracle: Oracle,
    supervisor: Supervisor,
}

impl Daemon {
    pub fn new(config: Config, layout: DeviceLayout, stdio: SavedStdio) -> Self {
        let oracle = Oracle::new(layout.clone(), config.daemon.db_timeout);
        Self {
            layout,
            watches: config.watches.into_iter().map(WatchEntry::new).collect(),
            oracle,
            supervisor: Supervisor::new(ProcessTable::default(), stdio),
        }
    }

    /// Runs until something fatal happens.
    pub fn run(&mut self) -> Result<Infallible> {
        loop {
            if !mount::is_mounted(&self.layout.mountpoint) {
                info!("{} isn't mounted, waiting for it to be . . .", self.layout.mountpoint.display());
                mount::wait_for_mount(&self.layout.mountpoint)?;
            }

            let inotify =
                Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).map_err(Error::sys("inotify_init1"))?;
            arm_watches(&inotify, &mut self.watches)?;

            info!("Listening for events.");
            self.listen(&inotify)?;
            // Dropping the instance closes it; the next iteration starts over.
            info!("Restarting the watch cycle.");
        }
    }

    /// Returns once the current set of watches has been torn down.
    fn listen(&mut self, inotify: &Inotify) -> Result<()> {
        loop {
            let ready = self.wait(inotify)?;

            for slot in ready.children {
                self.supervisor.reap(slot)?;
            }

            if ready.inotify {
                // Pipe hang-ups aren't reliable everywhere; catch what they missed.
                self.supervisor.reap_stale()?;

                let destroyed =
                    EventHandler::new(inotify, &mut self.watches, &self.oracle, &mut self.supervisor).drain()?;
                if destroyed {
                    return Ok(());
                }
            }
        }
    }

    /// Blocks until inotify or at least one child pipe needs attention.
    fn wait(&self, inotify: &Inotify) -> Result<Readiness> {
        let table = self.supervisor.table();
        debug!("Waiting on inotify and {} child pipe(s)", table.len());
        let mut fds = Vec::with_capacity(table.capacity());
        let mut slots = Vec::with_capacity(table.capacity());

        // Index 0 of the poll set is inotify, like slot 0 of the table.
        fds.push(PollFd::new(inotify.as_fd(), PollFlags::POLLIN));
        for (slot, pipe) in table.pipes() {
            fds.push(PollFd::new(pipe, PollFlags::POLLIN));
            slots.push(slot);
        }

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::sys("poll")(e)),
            }
        }

        Ok(collect_readiness(&fds, &slots))
    }
}

fn collect_readiness(fds: &[PollFd<'_>], slots: &[usize]) -> Readiness {
    let revents = |fd: &PollFd<'_>| fd.revents().unwrap_or(PollFlags::empty());

    let inotify = fds.first().is_some_and(|fd| revents(fd).contains(PollFlags::POLLIN));
    let children = fds
        .iter()
        .skip(1)
        .zip(slots)
        .filter(|(fd, _)| revents(fd).intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
        .map(|(_, &slot)| slot)
        .collect();

    let ready = Readiness { inotify, children };
    debug!("poll woke up: {ready:?}");
    ready
}
