//! # afd
//!
//! Command-line control of an AFD work directory.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use afd_cli::control::{self, Purge};
use afd_cli::exit::{INCORRECT, NO_ACTIVE_AFD, SUCCESS};
use afd_cli::host::{self, HostAction};
use afd_cli::status;
use afd_config::logging::init_logging_with;
use afd_config::path::{AFD_ACTIVE_FILE, AMG_CMD_FIFO, FSA_ID_FILE};
use afd_config::{Config, WorkDir};
use afd_ipc::fifo::send_bytes;
use afd_ipc::{ActiveLock, IpcError, REREAD_CONFIG};
use afd_status::{Fra, Fsa};

/// AFD: Automatic File Distribution
#[derive(Parser)]
#[command(name = "afd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// AFD work directory
    #[arg(short, long, global = true, env = "AFD_WORK_DIR")]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the AFD in the background
    Start {
        /// Skip the initial scan of the source directories
        #[arg(long)]
        no_dir_scan: bool,
    },

    /// Stop the AFD (exit code 2 when none is running)
    Shutdown {
        /// Kill an unresponsive AFD and remove its leftovers without asking
        #[arg(short, long)]
        force: bool,
    },

    /// Show the active AFD and the state of hosts and directories
    Status,

    /// Pause, resume, disable, enable or retry a host
    Host {
        #[arg(value_enum)]
        action: HostAction,

        /// Host alias as in HOST_CONFIG
        alias: String,
    },

    /// Re-read DIR_CONFIG and HOST_CONFIG
    Reread,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let work_dir = match &cli.work_dir {
        Some(path) => WorkDir::new(path),
        None => WorkDir::from_env(),
    };

    let config = match Config::load(&work_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("afd: {}", e);
            return ExitCode::from(INCORRECT);
        }
    };
    // Diagnostics stay quiet unless AFD_LOG or RUST_LOG asks for more
    init_logging_with("warn");

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("afd: {}", e);
            return ExitCode::from(INCORRECT);
        }
    };

    match rt.block_on(async_main(cli.command, work_dir, config)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("afd: {:#}", e);
            ExitCode::from(INCORRECT)
        }
    }
}

async fn async_main(command: Commands, work_dir: WorkDir, config: Config) -> Result<u8> {
    match command {
        Commands::Start { no_dir_scan } => {
            let dir_scan = config.afd.dir_scan_enabled && !no_dir_scan;
            control::start(&work_dir, &config, dir_scan).await
        }
        Commands::Shutdown { force } => control::shutdown(&work_dir, &config, Purge::from_flag(force)).await,
        Commands::Status => show_status(&work_dir),
        Commands::Host { action, alias } => match host::apply(&work_dir, action, &alias).await? {
            Some(change) => {
                println!("{}: {}", alias, action.past_tense());
                if !change.notified {
                    println!("(no AFD running, change takes effect at next start)");
                }
                Ok(SUCCESS)
            }
            None => {
                eprintln!("Unknown host alias {}", alias);
                Ok(INCORRECT)
            }
        },
        Commands::Reread => match send_bytes(&work_dir.fifo(AMG_CMD_FIFO), &[REREAD_CONFIG]).await {
            Ok(()) => {
                println!("Configuration reread requested");
                Ok(SUCCESS)
            }
            Err(IpcError::NoReader(_)) => {
                println!("No AFD active in {}", work_dir.root().display());
                Ok(NO_ACTIVE_AFD)
            }
            Err(e) => Err(e).context("Writing amg.cmd"),
        },
    }
}

fn show_status(work_dir: &WorkDir) -> Result<u8> {
    let code = match ActiveLock::probe(&work_dir.fifo(AFD_ACTIVE_FILE))? {
        Some(pid) => {
            println!("AFD active in {} (pid {})", work_dir.root().display(), pid);
            SUCCESS
        }
        None => {
            println!("No AFD active in {}", work_dir.root().display());
            NO_ACTIVE_AFD
        }
    };

    // Nothing was ever built here
    if !work_dir.fifo(FSA_ID_FILE).exists() {
        return Ok(code);
    }
    let fsa = Fsa::attach(work_dir).context("Attaching FSA")?;
    println!();
    print!("{}", status::render_hosts(&fsa.hosts()));
    let fra = Fra::attach(work_dir).context("Attaching FRA")?;
    if !fra.is_empty() {
        println!();
        print!("{}", status::render_dirs(&fra.dirs()));
    }
    Ok(code)
}
