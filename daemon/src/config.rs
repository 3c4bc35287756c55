use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::paths::MAIN_CONFIG_FILE_NAME;

/// Maximum number of watches, and of concurrently running spawns.
pub const WATCH_MAX: usize = 16;
/// Base SQLite busy timeout in milliseconds. Doubled for the on-close check.
pub const DEFAULT_DB_TIMEOUT_MS: u32 = 500;

const CONFIG_EXTENSION: &str = ".toml";
/// macOS litters FAT partitions with these resource forks.
const RESOURCE_FORK_PREFIX: &str = "._";

/// Everything loaded from the config directory. Read-only once loaded.
#[derive(Debug, Default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub watches: Vec<WatchConfig>,
}

/// Daemon-wide settings, from the `[daemon]` table of `kfmon.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Busy timeout for database access, in milliseconds.
    #[serde(default = "default_db_timeout")]
    pub db_timeout: u32,
    /// Log to syslog instead of the log file.
    #[serde(default)]
    pub use_syslog: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_timeout: DEFAULT_DB_TIMEOUT_MS,
            use_syslog: false,
        }
    }
}

/// One watched file, from the `[watch]` table of any other config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// Absolute path of the file to watch.
    pub filename: PathBuf,
    /// Absolute path of the program to launch once the file is closed.
    pub action: PathBuf,
    /// Patch title/author/comment into the database once processed.
    #[serde(default)]
    pub do_db_update: bool,
    /// Debug builds only: treat the file as always processed.
    #[serde(default)]
    pub skip_db_checks: bool,
    #[serde(default)]
    pub db_title: String,
    #[serde(default)]
    pub db_author: String,
    #[serde(default)]
    pub db_comment: String,
}

impl WatchConfig {
    fn validate(&self) -> Result<()> {
        if !self.filename.is_absolute() {
            bail!("filename '{}' is not an absolute path", self.filename.display());
        }
        if !self.action.is_absolute() {
            bail!("action '{}' is not an absolute path", self.action.display());
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonFile {
    #[serde(default)]
    daemon: DaemonConfig,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WatchFile {
    watch: WatchConfig,
}

/// Parses the daemon config file at `path`.
pub fn parse_daemon_config(path: &Path) -> Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let file: DaemonFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(file.daemon)
}

/// Parses and validates the watch config file at `path`.
pub fn parse_watch_config(path: &Path) -> Result<WatchConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let file: WatchFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    file.watch
        .validate()
        .with_context(|| format!("Invalid watch config: {}", path.display()))?;
    Ok(file.watch)
}

/// Walks `dir` and loads every config file in it.
///
/// `kfmon.toml` holds the daemon settings (defaults apply if it is absent);
/// every other `*.toml` file is one watch. Watches beyond [`WATCH_MAX`] are
/// discarded with a warning. A file that fails to load does not stop the walk,
/// but makes the whole load fail once the walk is done.
pub fn load_config(dir: &Path) -> Result<Config> {
    if !dir.is_dir() {
        bail!("Config directory '{}' does not exist", dir.display());
    }

    let mut config = Config::default();
    let mut seen = 0usize;
    let mut failures = 0usize;

    let walker = WalkDir::new(dir)
        .follow_links(true)
        .same_file_system(true)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable config entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_config_file(&name) {
            continue;
        }
        seen += 1;

        let path = entry.path();
        info!("Trying to load config file '{}' . . .", path.display());

        if name.eq_ignore_ascii_case(MAIN_CONFIG_FILE_NAME) {
            match parse_daemon_config(path) {
                Ok(daemon) => {
                    info!(
                        "Daemon config loaded from '{name}': db_timeout={}, use_syslog={}",
                        daemon.db_timeout, daemon.use_syslog
                    );
                    config.daemon = daemon;
                }
                Err(e) => {
                    error!("Failed to load main config file '{name}': {e:#}");
                    failures += 1;
                }
            }
            continue;
        }

        if config.watches.len() >= WATCH_MAX {
            warn!(
                "We've already setup the maximum amount of watches we can handle ({WATCH_MAX}), discarding '{name}'!"
            );
            continue;
        }

        match parse_watch_config(path) {
            Ok(watch) => {
                info!(
                    "Watch config @ index {} loaded from '{name}': filename={}, action={}, do_db_update={}, db_title={}, db_author={}, db_comment={}",
                    config.watches.len(),
                    watch.filename.display(),
                    watch.action.display(),
                    watch.do_db_update,
                    watch.db_title,
                    watch.db_author,
                    watch.db_comment,
                );
                config.watches.push(watch);
            }
            Err(e) => {
                error!("Failed to load watch config file '{name}': {e:#}");
                failures += 1;
            }
        }
    }

    if seen == 0 {
        bail!("Config directory '{}' appears to be empty", dir.display());
    }
    if failures > 0 {
        bail!("Failed to load {failures} config file(s) from '{}'", dir.display());
    }

    debug!(
        "Daemon config recap: db_timeout={}, use_syslog={}",
        config.daemon.db_timeout, config.daemon.use_syslog
    );
    for (idx, watch) in config.watches.iter().enumerate() {
        debug!("Watch config @ index {idx} recap: {watch:?}");
    }

    Ok(config)
}

fn is_config_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(CONFIG_EXTENSION) && !name.starts_with(RESOURCE_FORK_PREFIX)
}

fn default_db_timeout() -> u32 {
    DEFAULT_DB_TIMEOUT_MS
}
