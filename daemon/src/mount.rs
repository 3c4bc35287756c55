//! Waiting for the user partition to be mounted.
//!
//! The kernel flags `/proc/mounts` with `POLLERR | POLLPRI` whenever the mount
//! table changes, so we sleep in `poll` and re-scan after each change.
use std::fs::File;
use std::os::fd::AsFd;
use std::path::Path;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const PROC_MOUNTS: &str = "/proc/mounts";
/// Mount table changes to sit through before concluding the target never mounts.
pub const MAX_MOUNT_CHANGES: u32 = 15;

/// Single synchronous scan of the current mount table.
pub fn is_mounted(mountpoint: &Path) -> bool {
    match std::fs::read_to_string(PROC_MOUNTS) {
        Ok(table) => table_contains(&table, mountpoint),
        Err(e) => {
            warn!("Failed to read {PROC_MOUNTS}: {e}");
            false
        }
    }
}

/// Returns true if any entry of a `/proc/mounts`-formatted `table` is mounted
/// on exactly `mountpoint`.
pub fn table_contains(table: &str, mountpoint: &Path) -> bool {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let fsname = fields.next()?;
            let dir = fields.next()?;
            Some((fsname, dir))
        })
        .any(|(fsname, dir)| {
            let dir = unescape_mount_field(dir);
            debug!("Checking fs {fsname} mounted on {dir}");
            Path::new(&dir) == mountpoint
        })
}

/// Undoes the kernel's octal escaping of whitespace and backslashes (`\040`).
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3
        && digits[0] <= b'3'
        && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

/// Blocks until `mountpoint` shows up in the mount table.
///
/// Gives up with [`Error::MountTimeout`] after more than
/// [`MAX_MOUNT_CHANGES`] mount table changes that didn't bring it in.
pub fn wait_for_mount(mountpoint: &Path) -> Result<()> {
    let mounts = File::open(PROC_MOUNTS)?;
    let mut changes = 0u32;

    loop {
        let mut fds = [PollFd::new(mounts.as_fd(), PollFlags::POLLERR | PollFlags::POLLPRI)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::sys("poll")(e)),
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLERR)
            && on_mount_change(&mut changes, is_mounted(mountpoint), mountpoint)?
        {
            return Ok(());
        }
    }
}

/// Accounts for one mount table change. Returns true once `mountpoint` is in.
fn on_mount_change(changes: &mut u32, mounted: bool, mountpoint: &Path) -> Result<bool> {
    info!("Mountpoints changed (iteration nr. {changes})");
    *changes += 1;

    if mounted {
        info!("Yay! Target mountpoint {} is available!", mountpoint.display());
        return Ok(true);
    }

    if *changes > MAX_MOUNT_CHANGES {
        return Err(Error::MountTimeout {
            mountpoint: mountpoint.to_path_buf(),
            changes: *changes,
        });
    }
    Ok(false)
}
