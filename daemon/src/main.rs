mod config;
mod daemonize;
mod error;
mod event;
mod event_loop;
mod logging;
mod mount;
mod oracle;
mod paths;
mod process_monitor;
mod process_table;
mod watch;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use crate::event_loop::Daemon;
use crate::paths::DeviceLayout;
use crate::process_monitor::SavedStdio;

#[derive(Parser, Debug)]
#[command(name = "kfmon", version, about = "Launches actions when their icon is opened in the reader")]
struct Cli {
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(long)]
    foreground: bool,

    /// Directory holding kfmon.toml and one .toml file per watch.
    #[arg(long, default_value = paths::CONFIG_DIR)]
    config_dir: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init() {
        eprintln!("[logging] {e}");
    }

    if let Err(e) = run(cli) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    // ── Process setup ─────────────────────────────────────────────────────────
    daemonize::reset_priority();
    let stdio = if cli.foreground {
        SavedStdio::capture().context("Failed to save the original stdio")?
    } else {
        daemonize::daemonize(Path::new(paths::LOG_FILE))?
    };

    info!(
        "Initializing KFMon {} | Using SQLite {}",
        env!("CARGO_PKG_VERSION"),
        rusqlite::version()
    );

    // ── Configuration ─────────────────────────────────────────────────────────
    // The config lives on the user partition, which might not be up yet.
    let layout = DeviceLayout::default();
    if !mount::is_mounted(&layout.mountpoint) {
        info!("{} isn't mounted, waiting for it to be . . .", layout.mountpoint.display());
        mount::wait_for_mount(&layout.mountpoint)?;
    }

    let config = config::load_config(&cli.config_dir)
        .with_context(|| format!("Failed to load config from {}", cli.config_dir.display()))?;

    if config.daemon.use_syslog {
        info!("Logging to syslog from now on.");
        logging::switch_to_syslog();
        daemonize::silence_stderr()?;
    }

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut daemon = Daemon::new(config, layout, stdio);
    match daemon.run()? {}
}
