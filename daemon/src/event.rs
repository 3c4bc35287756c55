//! Turning inotify events on the watched files into launches.
//!
//! Per watch, an open is where we learn whether the reader software is done
//! with the file, and a close is where we launch. A close that follows an open
//! which found the file unprocessed is ignored: that's the reader importing it.
use std::path::Path;

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, Inotify, InotifyEvent};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::oracle::ProcessedCheck;
use crate::watch::{find_watch, WatchEntry};

/// Starts actions, and knows which watches currently have one running.
pub trait Launcher {
    /// Pid of the running spawn of `watch`, if any.
    fn spawned_pid(&self, watch: usize) -> Option<Pid>;

    fn is_spawned(&self, watch: usize) -> bool {
        self.spawned_pid(watch).is_some()
    }

    /// Launches `action` on behalf of `watch`.
    fn launch(&mut self, action: &Path, watch: usize) -> Result<Pid>;
}

/// Handles one readiness notification of the inotify descriptor.
pub struct EventHandler<'a, O, L> {
    inotify: &'a Inotify,
    watches: &'a mut [WatchEntry],
    oracle: &'a O,
    launcher: &'a mut L,
    /// Some watch was retired by the kernel in this batch.
    destroyed: bool,
    /// The filesystem went away, taking every watch with it.
    unmounted: bool,
}

impl<'a, O: ProcessedCheck, L: Launcher> EventHandler<'a, O, L> {
    pub fn new(inotify: &'a Inotify, watches: &'a mut [WatchEntry], oracle: &'a O, launcher: &'a mut L) -> Self {
        Self {
            inotify,
            watches,
            oracle,
            launcher,
            destroyed: false,
            unmounted: false,
        }
    }

    /// Reads and handles events until the descriptor would block.
    ///
    /// Returns true if a watch was destroyed, in which case every other watch
    /// has been torn down as well and the caller has to re-arm from scratch.
    pub fn drain(mut self) -> Result<bool> {
        loop {
            let events = match self.inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::sys("read")(e)),
            };
            if events.is_empty() {
                break;
            }

            for event in &events {
                self.handle(event)?;
            }

            if self.destroyed {
                self.teardown();
                break;
            }
        }
        Ok(self.destroyed)
    }

    fn handle(&mut self, event: &InotifyEvent) -> Result<()> {
        let mask = event.mask;
        let idx = find_watch(&*self.watches, event.wd);

        if mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            self.on_overflow(event, idx);
        }

        let Some(idx) = idx else {
            if !mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                warn!("!! Failed to match the current inotify event ({mask:?}) to any of our watched files! !!");
            }
            return Ok(());
        };

        if mask.contains(AddWatchFlags::IN_OPEN) {
            self.on_open(idx)?;
        }
        if mask.intersects(AddWatchFlags::IN_CLOSE) {
            self.on_close(idx)?;
        }
        if mask.contains(AddWatchFlags::IN_UNMOUNT) {
            info!("Tripped IN_UNMOUNT for {}", self.watches[idx].config.filename.display());
            self.unmounted = true;
        }
        if mask.contains(AddWatchFlags::IN_IGNORED) {
            info!("Tripped IN_IGNORED for {}", self.watches[idx].config.filename.display());
            self.mark_destroyed(idx);
        }
        Ok(())
    }

    fn on_open(&mut self, idx: usize) -> Result<()> {
        let entry = &mut self.watches[idx];
        info!("Tripped IN_OPEN for {}", entry.config.filename.display());

        // Nothing to decide while its last spawn is still up.
        if self.launcher.is_spawned(idx) {
            return Ok(());
        }

        if self.oracle.is_processed(&entry.config, false)? {
            entry.pending_processing = false;
        } else {
            entry.pending_processing = true;
            info!("Flagged target icon '{}' as pending processing ...", entry.config.filename.display());
        }
        Ok(())
    }

    fn on_close(&mut self, idx: usize) -> Result<()> {
        let entry = &mut self.watches[idx];
        info!("Tripped IN_CLOSE for {}", entry.config.filename.display());

        if let Some(pid) = self.launcher.spawned_pid(idx) {
            info!("Our last spawn ({pid}) is still alive!");
            return Ok(());
        }

        if !entry.pending_processing && self.oracle.is_processed(&entry.config, true)? {
            info!("Spawning {} . . .", entry.config.action.display());
            self.launcher.launch(&entry.config.action, idx)?;
        } else {
            info!(
                "Target icon '{}' might not have been fully processed yet, don't launch anything.",
                entry.config.filename.display()
            );
        }
        Ok(())
    }

    fn on_overflow(&mut self, event: &InotifyEvent, idx: Option<usize>) {
        match &event.name {
            Some(name) => warn!("Huh oh... Tripped IN_Q_OVERFLOW for {}", name.to_string_lossy()),
            None => warn!("Huh oh... Tripped IN_Q_OVERFLOW for... something?"),
        }
        // Events were lost: whatever we matched, start over from scratch.
        self.destroyed = true;

        let Some(idx) = idx else {
            return;
        };
        let entry = &self.watches[idx];
        if let Some(wd) = entry.inotify_wd {
            info!("Trying to remove inotify watch for '{}' @ index {idx}.", entry.config.filename.display());
            if let Err(e) = self.inotify.rm_watch(wd) {
                warn!("inotify_rm_watch: {e}");
            }
        }
        self.mark_destroyed(idx);
    }

    fn mark_destroyed(&mut self, idx: usize) {
        self.destroyed = true;
        self.watches[idx].watch_destroyed = true;
    }

    /// Removes every watch the kernel didn't already retire, and resets the
    /// destroyed flags. After an unmount there is nothing left to remove.
    fn teardown(&mut self) {
        for (idx, entry) in self.watches.iter_mut().enumerate() {
            if entry.watch_destroyed {
                entry.watch_destroyed = false;
            } else if !self.unmounted {
                if let Some(wd) = entry.inotify_wd {
                    info!("Trying to remove inotify watch for '{}' @ index {idx}.", entry.config.filename.display());
                    if let Err(e) = self.inotify.rm_watch(wd) {
                        warn!("inotify_rm_watch: {e}");
                    }
                }
            }
            entry.inotify_wd = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::watch::arm_watches;
    use nix::sys::inotify::{InitFlags, WatchDescriptor};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeOracle {
        processed: Cell<bool>,
        /// `wait_for_commit` of every call.
        calls: RefCell<Vec<bool>>,
    }

    impl ProcessedCheck for FakeOracle {
        fn is_processed(&self, _watch: &WatchConfig, wait_for_commit: bool) -> Result<bool> {
            self.calls.borrow_mut().push(wait_for_commit);
            Ok(self.processed.get())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        running: HashMap<usize, Pid>,
        launched: Vec<(PathBuf, usize)>,
    }

    impl Launcher for FakeLauncher {
        fn spawned_pid(&self, watch: usize) -> Option<Pid> {
            self.running.get(&watch).copied()
        }

        fn launch(&mut self, action: &Path, watch: usize) -> Result<Pid> {
            let pid = Pid::from_raw(1000 + self.launched.len() as i32);
            self.running.insert(watch, pid);
            self.launched.push((action.to_path_buf(), watch));
            Ok(pid)
        }
    }

    struct Fixture {
        dir: TempDir,
        inotify: Inotify,
        watches: Vec<WatchEntry>,
    }

    impl Fixture {
        fn new(count: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let watches = (0..count)
                .map(|i| {
                    let filename = dir.path().join(format!("icon{i}.png"));
                    std::fs::write(&filename, b"png").unwrap();
                    WatchEntry::new(WatchConfig {
                        filename,
                        action: PathBuf::from(format!("/mnt/onboard/launch{i}.sh")),
                        do_db_update: false,
                        skip_db_checks: false,
                        db_title: String::new(),
                        db_author: String::new(),
                        db_comment: String::new(),
                    })
                })
                .collect();
            let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).unwrap();
            let mut fx = Self { dir, inotify, watches };
            arm_watches(&fx.inotify, &mut fx.watches).unwrap();
            fx
        }

        /// Opens and closes watched file `idx`, queueing IN_OPEN + IN_CLOSE_NOWRITE.
        fn touch(&self, idx: usize) {
            drop(std::fs::File::open(&self.watches[idx].config.filename).unwrap());
        }

        fn wd(&self, idx: usize) -> WatchDescriptor {
            self.watches[idx].inotify_wd.unwrap()
        }

        fn drain(&mut self, oracle: &FakeOracle, launcher: &mut FakeLauncher) -> bool {
            EventHandler::new(&self.inotify, &mut self.watches, oracle, launcher)
                .drain()
                .unwrap()
        }

        fn pending_kernel_events(&self) -> Vec<InotifyEvent> {
            match self.inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) => Vec::new(),
                Err(e) => panic!("read_events: {e}"),
            }
        }
    }

    fn synthetic(wd: WatchDescriptor, mask: AddWatchFlags) -> InotifyEvent {
        InotifyEvent {
            wd,
            mask,
            cookie: 0,
            name: None,
        }
    }

    // ── open / close ──────────────────────────────────────────────────────────

    #[test]
    fn empty_queue_is_a_noop() {
        let mut fx = Fixture::new(1);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();
        assert!(!fx.drain(&oracle, &mut launcher));
        assert!(oracle.calls.borrow().is_empty());
    }

    #[test]
    fn unprocessed_open_suppresses_following_close() {
        let mut fx = Fixture::new(1);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();

        fx.touch(0);
        assert!(!fx.drain(&oracle, &mut launcher));

        assert!(fx.watches[0].pending_processing);
        assert!(launcher.launched.is_empty());
        // Only the open consulted the database; the close never got that far.
        assert_eq!(*oracle.calls.borrow(), vec![false]);
    }

    #[test]
    fn processed_file_launches_once_after_pending_clears() {
        let mut fx = Fixture::new(1);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();

        fx.touch(0);
        fx.drain(&oracle, &mut launcher);
        assert!(launcher.launched.is_empty());

        // The reader caught up: row and thumbnails are all there now.
        oracle.processed.set(true);
        fx.touch(0);
        fx.drain(&oracle, &mut launcher);

        assert!(!fx.watches[0].pending_processing);
        assert_eq!(launcher.launched, vec![(PathBuf::from("/mnt/onboard/launch0.sh"), 0)]);
        // open (no commit wait), then close (commit wait) for the second pair.
        assert_eq!(*oracle.calls.borrow(), vec![false, false, true]);
    }

    #[test]
    fn running_spawn_suppresses_new_launches() {
        let mut fx = Fixture::new(1);
        let oracle = FakeOracle::default();
        oracle.processed.set(true);
        let mut launcher = FakeLauncher::default();

        fx.touch(0);
        fx.drain(&oracle, &mut launcher);
        assert_eq!(launcher.launched.len(), 1);
        let calls_after_launch = oracle.calls.borrow().len();

        fx.touch(0);
        fx.touch(0);
        fx.drain(&oracle, &mut launcher);

        assert_eq!(launcher.launched.len(), 1);
        assert_eq!(launcher.running.len(), 1);
        // Neither opens nor closes hit the database while the spawn is up.
        assert_eq!(oracle.calls.borrow().len(), calls_after_launch);
    }

    #[test]
    fn pending_flag_is_tracked_per_watch() {
        let mut fx = Fixture::new(2);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();

        fx.touch(0);
        fx.drain(&oracle, &mut launcher);
        assert!(fx.watches[0].pending_processing);

        oracle.processed.set(true);
        // Watch 0 still being pending doesn't hold back watch 1.
        let file = std::fs::File::open(&fx.watches[1].config.filename).unwrap();
        fx.drain(&oracle, &mut launcher);
        drop(file);
        fx.drain(&oracle, &mut launcher);

        assert!(fx.watches[0].pending_processing);
        assert_eq!(launcher.launched, vec![(PathBuf::from("/mnt/onboard/launch1.sh"), 1)]);
    }

    // ── watch destruction ─────────────────────────────────────────────────────

    #[test]
    fn ignored_watch_tears_down_the_others() {
        let mut fx = Fixture::new(2);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();
        let wd1 = fx.wd(1);

        // Retire watch 0 behind the handler's back, as the kernel would on unlink.
        fx.inotify.rm_watch(fx.wd(0)).unwrap();
        assert!(fx.drain(&oracle, &mut launcher));

        assert!(fx.watches.iter().all(|w| !w.watch_destroyed));
        assert!(fx.watches.iter().all(|w| w.inotify_wd.is_none()));
        // Watch 1 was removed explicitly, so the kernel acknowledged it.
        let leftovers = fx.pending_kernel_events();
        assert!(leftovers
            .iter()
            .any(|e| e.wd == wd1 && e.mask.contains(AddWatchFlags::IN_IGNORED)));
    }

    #[test]
    fn ignored_marks_exactly_that_entry() {
        let mut fx = Fixture::new(3);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();
        let wd = fx.wd(1);

        let mut handler = EventHandler::new(&fx.inotify, &mut fx.watches, &oracle, &mut launcher);
        handler.handle(&synthetic(wd, AddWatchFlags::IN_IGNORED)).unwrap();
        assert!(handler.destroyed);
        let flags: Vec<bool> = handler.watches.iter().map(|w| w.watch_destroyed).collect();
        assert_eq!(flags, vec![false, true, false]);

        handler.teardown();
        assert!(handler.watches.iter().all(|w| !w.watch_destroyed));
    }

    #[test]
    fn unmount_skips_explicit_removal() {
        let mut fx = Fixture::new(2);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();
        let wd0 = fx.wd(0);

        {
            let mut handler = EventHandler::new(&fx.inotify, &mut fx.watches, &oracle, &mut launcher);
            handler.handle(&synthetic(wd0, AddWatchFlags::IN_UNMOUNT)).unwrap();
            handler.handle(&synthetic(wd0, AddWatchFlags::IN_IGNORED)).unwrap();
            assert!(handler.unmounted);
            handler.teardown();
        }

        assert!(fx.watches.iter().all(|w| w.inotify_wd.is_none() && !w.watch_destroyed));
        // No rm_watch was issued, so the kernel has nothing to acknowledge.
        assert!(fx.pending_kernel_events().is_empty());
    }

    #[test]
    fn overflow_on_known_watch_removes_it() {
        let mut fx = Fixture::new(2);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();
        let wd0 = fx.wd(0);
        let wd1 = fx.wd(1);

        {
            let mut handler = EventHandler::new(&fx.inotify, &mut fx.watches, &oracle, &mut launcher);
            handler.handle(&synthetic(wd0, AddWatchFlags::IN_Q_OVERFLOW)).unwrap();
            assert!(handler.destroyed);
            assert!(handler.watches[0].watch_destroyed);
            assert!(!handler.watches[1].watch_destroyed);
            handler.teardown();
        }

        let ignored: Vec<WatchDescriptor> = fx
            .pending_kernel_events()
            .into_iter()
            .filter(|e| e.mask.contains(AddWatchFlags::IN_IGNORED))
            .map(|e| e.wd)
            .collect();
        assert!(ignored.contains(&wd0));
        assert!(ignored.contains(&wd1));
    }

    #[test]
    fn unmatched_overflow_still_restarts_everything() {
        let mut fx = Fixture::new(1);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();
        let stray_path = fx.dir.path().join("stray.png");
        std::fs::write(&stray_path, b"").unwrap();
        let stray = fx.inotify.add_watch(stray_path.as_path(), AddWatchFlags::IN_OPEN).unwrap();

        let mut handler = EventHandler::new(&fx.inotify, &mut fx.watches, &oracle, &mut launcher);
        handler.handle(&synthetic(stray, AddWatchFlags::IN_Q_OVERFLOW)).unwrap();
        assert!(handler.destroyed);
        assert!(!handler.watches[0].watch_destroyed);
        handler.teardown();
        assert!(handler.watches[0].inotify_wd.is_none());
    }

    #[test]
    fn unmatched_events_are_ignored() {
        let mut fx = Fixture::new(1);
        let oracle = FakeOracle::default();
        let mut launcher = FakeLauncher::default();
        let stray_path = fx.dir.path().join("stray.png");
        std::fs::write(&stray_path, b"").unwrap();
        fx.inotify
            .add_watch(stray_path.as_path(), AddWatchFlags::IN_OPEN | AddWatchFlags::IN_CLOSE)
            .unwrap();

        drop(std::fs::File::open(&stray_path).unwrap());
        assert!(!fx.drain(&oracle, &mut launcher));
        assert!(oracle.calls.borrow().is_empty());
        assert!(launcher.launched.is_empty());
    }
}
