//! afdd: runs one AFD instance in the foreground.
//!
//! Normally started by `afd start`, which detaches it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use afd_config::logging::init_logging_with;
use afd_config::{Config, WorkDir};

#[derive(Parser)]
#[command(name = "afdd")]
#[command(author, version, about = "AFD supervisor: generator, dispatcher and log drain", long_about = None)]
struct Cli {
    /// AFD work directory
    #[arg(short, long, env = "AFD_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Do not scan the source directories at startup
    #[arg(long)]
    no_dir_scan: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let work_dir = match cli.work_dir {
        Some(path) => WorkDir::new(path),
        None => WorkDir::from_env(),
    };
    let config = Config::load(&work_dir)
        .with_context(|| format!("loading {}", work_dir.afd_config().display()))?;
    init_logging_with(&config.logging.level);

    let scan_at_start = config.afd.dir_scan_enabled && !cli.no_dir_scan;
    afd_daemon::run(work_dir, config, scan_at_start).await
}
