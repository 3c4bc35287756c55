use nix::sys::inotify::{AddWatchFlags, Inotify, WatchDescriptor};
use tracing::info;

use crate::config::WatchConfig;
use crate::error::{Error, Result};

/// Events we subscribe to on every watched file.
pub const WATCH_MASK: AddWatchFlags = AddWatchFlags::IN_OPEN.union(AddWatchFlags::IN_CLOSE);

/// A configured watch plus the state the event loop keeps for it.
#[derive(Debug, Clone)]
pub struct WatchEntry {
    pub config: WatchConfig,
    /// Set while the watch is armed on the current inotify instance.
    pub inotify_wd: Option<WatchDescriptor>,
    /// The kernel retired this watch during the current batch.
    pub watch_destroyed: bool,
    /// Opened before the reader was done processing it; a close won't launch
    /// until an open finds it processed.
    pub pending_processing: bool,
}

impl WatchEntry {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            inotify_wd: None,
            watch_destroyed: false,
            pending_processing: false,
        }
    }
}

/// Arms an open/close watch for every entry on `inotify`.
///
/// Every configured file must be watchable: the first failure is returned.
pub fn arm_watches(inotify: &Inotify, watches: &mut [WatchEntry]) -> Result<()> {
    for (idx, entry) in watches.iter_mut().enumerate() {
        let wd = inotify
            .add_watch(entry.config.filename.as_path(), WATCH_MASK)
            .map_err(|source| Error::AddWatch {
                path: entry.config.filename.clone(),
                source,
            })?;
        entry.inotify_wd = Some(wd);
        info!("Setup an inotify watch for '{}' @ index {idx}.", entry.config.filename.display());
    }
    Ok(())
}

/// Index of the entry armed with `wd`.
pub fn find_watch(watches: &[WatchEntry], wd: WatchDescriptor) -> Option<usize> {
    watches.iter().position(|entry| entry.inotify_wd == Some(wd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::inotify::InitFlags;
    use std::path::{Path, PathBuf};

    fn entry_for(path: &Path) -> WatchEntry {
        WatchEntry::new(WatchConfig {
            filename: path.to_path_buf(),
            action: PathBuf::from("/bin/true"),
            do_db_update: false,
            skip_db_checks: false,
            db_title: String::new(),
            db_author: String::new(),
            db_comment: String::new(),
        })
    }

    #[test]
    fn arm_watches_assigns_distinct_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).unwrap();
        let mut watches = vec![entry_for(&a), entry_for(&b)];
        arm_watches(&inotify, &mut watches).unwrap();

        let wd_a = watches[0].inotify_wd.unwrap();
        let wd_b = watches[1].inotify_wd.unwrap();
        assert_ne!(wd_a, wd_b);
        assert_eq!(find_watch(&watches, wd_a), Some(0));
        assert_eq!(find_watch(&watches, wd_b), Some(1));
    }

    #[test]
    fn arm_watches_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).unwrap();
        let mut watches = vec![entry_for(&dir.path().join("missing.png"))];
        assert!(matches!(
            arm_watches(&inotify, &mut watches),
            Err(Error::AddWatch { .. })
        ));
        assert!(watches[0].inotify_wd.is_none());
    }

    #[test]
    fn new_entry_is_unarmed() {
        let entry = entry_for(Path::new("/mnt/onboard/icon.png"));
        assert!(entry.inotify_wd.is_none());
        assert!(!entry.watch_destroyed);
        assert!(!entry.pending_processing);
    }
}
