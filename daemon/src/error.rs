//! Fatal errors raised by the launch engine.
//!
//! Nothing in the core exits the process on its own: every failure listed here
//! is propagated up to `main`, which logs it and exits.
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Any database failure other than "no row".
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A system call failed in a way we cannot recover from.
    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    /// Every configured file must be watchable.
    #[error("cannot watch {}: {source}", path.display())]
    AddWatch {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("no free process table entry to track a new spawn")]
    ProcessTableFull,

    #[error("action path {} cannot be executed (embedded NUL byte)", .0.display())]
    InvalidAction(PathBuf),

    #[error("{} did not show up after {changes} mount table changes", mountpoint.display())]
    MountTimeout { mountpoint: PathBuf, changes: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn sys(op: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| Self::Sys { op, source }
    }
}
