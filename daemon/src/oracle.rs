//! Deciding whether the stock reader software is done with a watched file.
//!
//! A file counts as processed once the reader has a book row for it in its
//! content database *and* has rendered all three of its cover thumbnails.
//! Opening the file before that point is the reader's own import poking at
//! it, and launching anything then would race its post-processing.
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{named_params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::Result;
use crate::paths::DeviceLayout;

/// Rollback journal polling: 250ms steps, for at most ~10s.
pub const JOURNAL_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const JOURNAL_POLL_ATTEMPTS: u32 = 40;

/// Thumbnail flavours the reader renders for every book, in the order it
/// renders them: full-size screensaver, home screen tile, library grid.
pub const THUMBNAIL_SUFFIXES: [&str; 3] = ["N3_FULL", "N3_LIBRARY_FULL", "N3_LIBRARY_GRID"];

// ContentType '6' is a book. Single images get imported as comics, hence books.
const SQL_BOOK_EXISTS: &str =
    "SELECT EXISTS(SELECT 1 FROM content WHERE ContentID = :id AND ContentType = '6');";
const SQL_IMAGE_ID: &str = "SELECT ImageID FROM content WHERE ContentID = :id AND ContentType = '6';";
const SQL_TITLE: &str = "SELECT Title FROM content WHERE ContentID = :id AND ContentType = '6';";
const SQL_UPDATE_METADATA: &str = "UPDATE content SET Title = :title, Attribution = :author, Description = :comment WHERE ContentID = :id AND ContentType = '6';";

/// Answers "has this watched file been fully processed?".
pub trait ProcessedCheck {
    /// `wait_for_commit` is set for the on-close check: it waits longer on a
    /// busy database and lets a pending commit land before returning.
    fn is_processed(&self, watch: &WatchConfig, wait_for_commit: bool) -> Result<bool>;
}

/// Qt4's `qHash` over a byte string, as used by the reader to shard its
/// thumbnail cache. Always fits in 28 bits.
pub fn qhash(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |h, &b| {
        let mut h = (h << 4).wrapping_add(u32::from(b));
        h ^= (h & 0xf000_0000) >> 23;
        h & 0x0fff_ffff
    })
}

/// The two directory levels of the thumbnail cache derived from `hash`.
pub fn shard_dirs(hash: u32) -> (u8, u8) {
    ((hash & 0xff) as u8, ((hash & 0xff00) >> 8) as u8)
}

/// `<images>/<dir1>/<dir2>` for a given ImageID.
pub fn thumbnail_dir(images_dir: &Path, image_id: &[u8]) -> PathBuf {
    let (dir1, dir2) = shard_dirs(qhash(image_id));
    images_dir.join(dir1.to_string()).join(dir2.to_string())
}

/// The reader's ContentID for a file on its partition.
pub fn content_id(filename: &Path) -> String {
    format!("file://{}", filename.display())
}

/// Result of the optional metadata patch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetadataPatch {
    AlreadyCurrent,
    Updated,
    Failed,
}

/// [`ProcessedCheck`] backed by the reader's SQLite database.
///
/// Every check opens its own connection and runs each statement on its own;
/// we never hold a transaction against a database we don't own.
#[derive(Debug, Clone)]
pub struct Oracle {
    layout: DeviceLayout,
    db_timeout: Duration,
    journal_poll_interval: Duration,
    journal_poll_attempts: u32,
}

impl Oracle {
    pub fn new(layout: DeviceLayout, db_timeout_ms: u32) -> Self {
        Self {
            layout,
            db_timeout: Duration::from_millis(u64::from(db_timeout_ms)),
            journal_poll_interval: JOURNAL_POLL_INTERVAL,
            journal_poll_attempts: JOURNAL_POLL_ATTEMPTS,
        }
    }

    #[cfg(test)]
    pub fn with_journal_policy(mut self, interval: Duration, attempts: u32) -> Self {
        self.journal_poll_interval = interval;
        self.journal_poll_attempts = attempts;
        self
    }

    /// The on-close check waits twice as long: a commit is likely in flight.
    fn busy_timeout(&self, wait_for_commit: bool) -> Duration {
        if wait_for_commit {
            self.db_timeout * 2
        } else {
            self.db_timeout
        }
    }

    fn open(&self, watch: &WatchConfig, wait_for_commit: bool) -> Result<Connection> {
        // Only ever open read-write when the user asked for the metadata patch.
        let access = if watch.do_db_update {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        };
        let conn =
            Connection::open_with_flags(&self.layout.database, access | OpenFlags::SQLITE_OPEN_FULL_MUTEX)?;

        let timeout = self.busy_timeout(wait_for_commit);
        conn.busy_timeout(timeout)?;
        debug!("SQLite busy timeout set to {}ms", timeout.as_millis());
        Ok(conn)
    }

    /// Counts the rendered thumbnails for `image_id`, logging the missing ones.
    fn thumbnails_present(&self, image_id: &[u8]) -> usize {
        let dir = thumbnail_dir(&self.layout.images_dir(), image_id);
        debug!("Checking for thumbnails in '{}' . . .", dir.display());
        let image_id = String::from_utf8_lossy(image_id);

        THUMBNAIL_SUFFIXES
            .iter()
            .filter(|suffix| {
                let path = dir.join(format!("{image_id} - {suffix}.parsed"));
                let present = path.exists();
                if !present {
                    info!("Thumbnail '{}' hasn't been parsed yet!", path.display());
                }
                present
            })
            .count()
    }

    /// Writes the configured title/author/comment, unless the title already
    /// matches. A failing UPDATE is logged, not fatal.
    fn patch_metadata(&self, conn: &Connection, watch: &WatchConfig, id: &str) -> Result<MetadataPatch> {
        let title: Option<Option<String>> = conn
            .query_row(SQL_TITLE, named_params! { ":id": id }, |row| row.get(0))
            .optional()?;
        if title.flatten().as_deref() == Some(watch.db_title.as_str()) {
            debug!("Database metadata for '{id}' is already up to date");
            return Ok(MetadataPatch::AlreadyCurrent);
        }

        let updated = conn.execute(
            SQL_UPDATE_METADATA,
            named_params! {
                ":title": watch.db_title,
                ":author": watch.db_author,
                ":comment": watch.db_comment,
                ":id": id,
            },
        );
        match updated {
            Ok(_) => {
                info!("Successfully updated DB data for '{id}'");
                Ok(MetadataPatch::Updated)
            }
            Err(e) => {
                warn!("UPDATE SQL query failed for '{id}': {e}");
                Ok(MetadataPatch::Failed)
            }
        }
    }

    /// Gives a pending commit a chance to land. Advisory only: we go on
    /// regardless once the attempts run out.
    fn wait_for_journal(&self) {
        let journal = self.layout.journal_path();
        let mut count = 0u32;
        while journal.exists() {
            info!("Found a SQLite rollback journal, waiting for it to go away (iteration nr. {count}) . . .");
            count += 1;
            std::thread::sleep(self.journal_poll_interval);
            if count >= self.journal_poll_attempts {
                warn!("Waited for the SQLite rollback journal to go away for far too long, going on anyway.");
                break;
            }
        }
    }
}

impl ProcessedCheck for Oracle {
    fn is_processed(&self, watch: &WatchConfig, wait_for_commit: bool) -> Result<bool> {
        if cfg!(debug_assertions) && watch.skip_db_checks {
            debug!("Skipping database checks for '{}'", watch.filename.display());
            return Ok(true);
        }

        let conn = self.open(watch, wait_for_commit)?;
        let id = content_id(&watch.filename);

        let exists: bool = conn.query_row(SQL_BOOK_EXISTS, named_params! { ":id": id }, |row| row.get(0))?;
        if !exists {
            debug!("No content row for '{id}'");
            return Ok(false);
        }

        let image_id: Option<Vec<u8>> = conn
            .query_row(SQL_IMAGE_ID, named_params! { ":id": id }, |row| {
                Ok(match row.get_ref(0)? {
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Some(bytes.to_vec()),
                    _ => None,
                })
            })
            .optional()?
            .flatten();
        let Some(image_id) = image_id else {
            info!("Content row for '{id}' has no ImageID yet");
            return Ok(false);
        };

        if self.thumbnails_present(&image_id) != THUMBNAIL_SUFFIXES.len() {
            return Ok(false);
        }

        if watch.do_db_update {
            self.patch_metadata(&conn, watch, &id)?;
        }

        if wait_for_commit {
            self.wait_for_journal();
        }

        Ok(true)
    }
}
