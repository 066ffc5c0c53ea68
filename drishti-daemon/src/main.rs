// drishti command line: run the daemon or manage trigger definitions

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use drishti_daemon::config::LoggingConfig;
use drishti_daemon::{Daemon, DaemonConfig, ExitReason, IpcChannel, TriggerStore, EXIT_RESTART};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RESTARTS_ENV: &str = "DRISHTI_RESTARTS";
const MAX_RESPAWN_BACKOFF_SECS: u64 = 30;
/// A process that ran this long before failing starts the backoff over.
const HEALTHY_UPTIME: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "drishti")]
#[command(about = "Vision trigger daemon for robot task sequencing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, short, global = true, default_value = "drishti.toml")]
    config: PathBuf,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection daemon
    Run,

    /// Manage stored trigger definitions
    Triggers {
        #[command(subcommand)]
        command: TriggerCommands,
    },

    /// Show daemon liveness and the last published event
    Status,
}

#[derive(Subcommand)]
enum TriggerCommands {
    /// List well-formed trigger units
    List,

    /// Print one unit as JSON
    Show { name: String },

    /// Check one unit, or every unit when no name is given
    Validate { name: Option<String> },

    /// Delete a unit (a backup is taken first)
    Delete { name: String },

    /// List backups of a unit, newest first
    Backups { name: String },

    /// Restore a unit from one of its backups
    Restore { name: String, backup: String },
}

fn init_logging(config: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.apply_env();
    config.validate().context("invalid configuration")?;
    init_logging(&config.logging, cli.verbose);

    match cli.command {
        Commands::Run => {
            let code = run_daemon(config).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Triggers { command } => {
            let store = TriggerStore::open(&config.daemon.triggers_dir, config.daemon.backup_retention)
                .context("failed to open trigger store")?;
            manage_triggers(&store, command)
        }
        Commands::Status => show_status(&IpcChannel::new(&config.daemon.ipc_dir)),
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<i32> {
    let restarts: u32 = std::env::var(RESTARTS_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), restarts, "drishti starting");

    let source = drishti_eye::build_source(&config.camera).context("invalid camera configuration")?;
    let mut daemon = match Daemon::init_after_restarts(config.clone(), source, restarts).await {
        Ok(daemon) => daemon,
        Err(e) => {
            let ipc = IpcChannel::new(&config.daemon.ipc_dir);
            if ipc.init(Utc::now()).is_ok() {
                let _ = ipc.publish_error(&format!("initialization failed: {}", e), Utc::now());
            }
            return Err(e).context("daemon initialization failed");
        }
    };

    install_signal_handlers(&daemon);

    let started = Instant::now();
    match daemon.run().await.context("daemon loop failed")? {
        ExitReason::Shutdown => Ok(0),
        ExitReason::Restart(reason) => {
            let restarts = restart_count(restarts, started.elapsed());
            Ok(respawn(&config, restarts, &reason).await)
        }
    }
}

fn install_signal_handlers(daemon: &Daemon) {
    let shutdown = daemon.shutdown_signal();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("ctrl-c received, shutting down");
        shutdown.trigger();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown = daemon.shutdown_signal();
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::spawn(async move {
                    if term.recv().await.is_some() {
                        info!("SIGTERM received, shutting down");
                        shutdown.trigger();
                    }
                });
            }
            Err(e) => warn!("failed to install SIGTERM handler: {}", e),
        }

        let reload = daemon.reload_signal();
        match signal(SignalKind::hangup()) {
            Ok(mut hup) => {
                tokio::spawn(async move {
                    while hup.recv().await.is_some() {
                        info!("SIGHUP received, reloading triggers before next cycle");
                        reload.request();
                    }
                });
            }
            Err(e) => warn!("failed to install SIGHUP handler: {}", e),
        }
    }
}

/// Consecutive restarts so far, forgetting the ones before a healthy run.
fn restart_count(previous: u32, uptime: Duration) -> u32 {
    if uptime >= HEALTHY_UPTIME {
        if previous > 0 {
            info!("Ran {:?} since the last restart, resetting backoff", uptime);
        }
        0
    } else {
        previous
    }
}

fn respawn_backoff(restarts: u32) -> Duration {
    Duration::from_secs((1u64 << restarts.min(5)).min(MAX_RESPAWN_BACKOFF_SECS))
}

/// Replace this process with a fresh one, or hand the restart to a
/// supervisor via the exit code.
async fn respawn(config: &DaemonConfig, restarts: u32, reason: &str) -> i32 {
    if !config.daemon.self_respawn {
        warn!("Exiting for supervisor restart: {}", reason);
        return EXIT_RESTART;
    }

    let backoff = respawn_backoff(restarts);
    info!("Respawning in {:?} (restart #{})", backoff, restarts + 1);
    tokio::time::sleep(backoff).await;

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        match std::env::current_exe() {
            Ok(exe) => {
                let err = std::process::Command::new(exe)
                    .args(std::env::args_os().skip(1))
                    .env(RESTARTS_ENV, (restarts + 1).to_string())
                    .exec();
                error!("Failed to re-exec: {}", err);
            }
            Err(e) => error!("Cannot locate own executable: {}", e),
        }
    }
    EXIT_RESTART
}

fn manage_triggers(store: &TriggerStore, command: TriggerCommands) -> Result<()> {
    match command {
        TriggerCommands::List => {
            let units = store.list()?;
            if units.is_empty() {
                println!("No triggers in {}", store.root().display());
            }
            for unit in units {
                println!(
                    "{:<24} {:<10} {:<8} zones={} {}",
                    unit.key,
                    unit.kind.to_string(),
                    if unit.enabled { "enabled" } else { "disabled" },
                    unit.zones,
                    unit.name
                );
            }
        }
        TriggerCommands::Show { name } => {
            let unit = store.load(&name)?;
            println!("{}", serde_json::to_string_pretty(&unit)?);
        }
        TriggerCommands::Validate { name: Some(name) } => {
            let unit = store.validate(&name)?;
            println!("{}: ok ({} zones)", unit.trigger.id, unit.zones.len());
        }
        TriggerCommands::Validate { name: None } => {
            let report = store.scan()?;
            for (key, _) in &report.units {
                println!("{}: ok", key);
            }
            for (key, err) in &report.skipped {
                println!("{}: {}", key, err);
            }
            if !report.skipped.is_empty() {
                anyhow::bail!("{} invalid trigger units", report.skipped.len());
            }
        }
        TriggerCommands::Delete { name } => {
            store.delete(&name)?;
            println!("Deleted {}", name);
        }
        TriggerCommands::Backups { name } => {
            for backup in store.list_backups(&name)? {
                println!("{}  {}", backup.name, backup.created_at.to_rfc3339());
            }
        }
        TriggerCommands::Restore { name, backup } => {
            let unit = store.restore_backup(&name, &backup)?;
            println!("Restored {} from {}", unit.trigger.id, backup);
        }
    }
    Ok(())
}

fn show_status(ipc: &IpcChannel) -> Result<()> {
    let now = Utc::now();
    match ipc.read_liveness()? {
        Some(liveness) => println!(
            "pid {} mode {} cycles {} restarts {} heartbeat {:.1}s ago",
            liveness.pid,
            liveness.mode,
            liveness.cycles,
            liveness.restarts,
            liveness.age_seconds(now)
        ),
        None => println!("No liveness record in {}", ipc.dir().display()),
    }
    match ipc.read_events()? {
        Some(events) => println!("{}", serde_json::to_string_pretty(&events)?),
        None => println!("No events published yet"),
    }
    Ok(())
}
