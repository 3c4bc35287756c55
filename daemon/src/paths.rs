//! Canonical file paths on the device.
//!
//! Everything the stock reader software owns lives on the user-visible
//! partition mounted at [`TARGET_MOUNTPOINT`]:
//!   - `.kobo/KoboReader.sqlite`  The content database we poll.
//!   - `.kobo-images/`            The sharded thumbnail cache.
//!   - `.adds/kfmon/config/`      Our own config files.
use std::path::{Path, PathBuf};

pub const TARGET_MOUNTPOINT: &str = "/mnt/onboard";
pub const DATABASE_PATH: &str = "/mnt/onboard/.kobo/KoboReader.sqlite";
pub const CONFIG_DIR: &str = "/mnt/onboard/.adds/kfmon/config";
/// Lives on the root filesystem so it survives the user partition going away.
pub const LOG_FILE: &str = "/usr/local/kfmon/kfmon.log";
pub const MAIN_CONFIG_FILE_NAME: &str = "kfmon.toml";

const IMAGES_DIR_NAME: &str = ".kobo-images";
const JOURNAL_SUFFIX: &str = "-journal";

/// Where the third-party store lives.
///
/// Held by the core instead of reading the constants directly, so tests can
/// point it at a scratch directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLayout {
    pub mountpoint: PathBuf,
    pub database: PathBuf,
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from(TARGET_MOUNTPOINT),
            database: PathBuf::from(DATABASE_PATH),
        }
    }
}

impl DeviceLayout {
    /// Builds a layout rooted at `mountpoint`, with the database at its usual
    /// relative location.
    #[cfg(test)]
    pub fn rooted_at(mountpoint: &Path) -> Self {
        Self {
            mountpoint: mountpoint.to_path_buf(),
            database: mountpoint.join(".kobo").join("KoboReader.sqlite"),
        }
    }

    /// Root of the thumbnail cache: `<mount>/.kobo-images`
    pub fn images_dir(&self) -> PathBuf {
        self.mountpoint.join(IMAGES_DIR_NAME)
    }

    /// SQLite's rollback journal sidecar: `<database>-journal`
    pub fn journal_path(&self) -> PathBuf {
        let mut path = self.database.clone().into_os_string();
        path.push(JOURNAL_SUFFIX);
        PathBuf::from(path)
    }
}
