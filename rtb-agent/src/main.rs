//! Real-time backup agent - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use rtb_agent::{
    config::Config, daemon, daemon::shutdown::ShutdownCoordinator, scan::Scanner, utils,
    BackupAgent,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Do not watch for live changes. This build has no kernel change
    /// notification backend, so changes are always found by periodic
    /// rescans and this flag only silences the startup warning.
    #[arg(long)]
    disable_monitor: bool,

    /// Back up the whole surface area, then keep watching
    #[arg(long, conflicts_with = "initial_backup_then_exit")]
    initial_backup_then_monitor: bool,

    /// Back up the whole surface area, then exit
    #[arg(long)]
    initial_backup_then_exit: bool,

    /// Check these paths once and exit
    #[arg(long, value_name = "PATH", num_args = 1..)]
    check: Vec<String>,

    /// Record a rename of FROM to TO and exit
    #[arg(long = "move", value_names = ["FROM", "TO"], num_args = 2)]
    move_paths: Option<Vec<String>>,

    /// Write the effective configuration to PATH and exit
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };

    if let Some(path) = &args.write_config {
        std::fs::write(path, config.to_toml_string()?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, config.log.error_log_file.as_deref())?;

    tracing::info!(
        "Starting rtb-agent v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id
    );
    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root: snapshots and other processes' open handles may be inaccessible");
    }

    let agent = daemon::build_agent(&config)?;
    let shutdown = ShutdownCoordinator::new();
    agent.start();

    let one_shot = !args.check.is_empty() || args.move_paths.is_some();
    if one_shot {
        run_one_shot(&agent, &args).await;
        agent.stop().await;
        return Ok(());
    }

    let scanner = Arc::new(Scanner::new(
        Arc::clone(&agent),
        &config.surface_area,
        &config.pipeline,
    ));

    if args.initial_backup_then_exit || args.initial_backup_then_monitor {
        let token = shutdown.token();
        let initial = {
            let scanner = Arc::clone(&scanner);
            tokio::spawn(async move { scanner.initial_backup(&token).await })
        };
        tokio::select! {
            result = initial => {
                if let Err(e) = result? {
                    tracing::error!(error = %e, "Initial backup failed");
                }
            }
            result = shutdown.wait_for_signal() => result?,
        }

        if args.initial_backup_then_exit || shutdown.token().is_cancelled() {
            agent.stop().await;
            return Ok(());
        }
    }

    if args.disable_monitor || !config.pipeline.enable_file_access_notify {
        tracing::info!("Live change monitoring disabled");
    } else {
        tracing::warn!(
            "No kernel change notification backend is available in this build; changes are picked up by periodic rescans"
        );
    }

    let rescans = {
        let scanner = Arc::clone(&scanner);
        let scan_config = config.scan.clone();
        let token = shutdown.token();
        tokio::spawn(async move { scanner.run_periodic(&scan_config, &token).await })
    };

    shutdown.wait_for_signal().await?;

    if let Err(e) = rescans.await {
        tracing::error!("Rescan task panicked: {}", e);
    }
    agent.stop().await;
    Ok(())
}

async fn run_one_shot(agent: &BackupAgent, args: &Args) {
    if let Some(paths) = &args.move_paths {
        if let [from, to] = paths.as_slice() {
            agent.notify_move(from, to);
        }
    }
    agent.check_paths(&args.check);

    if agent.wait_for_idle().await {
        tracing::info!("All requested work is done");
    }
}
