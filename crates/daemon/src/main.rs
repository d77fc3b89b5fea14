//! PtyBridge Daemon
//!
//! Serves interactive shells to browser terminals over WebSocket.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::logging;
use daemon::session::default_shell;
use daemon::ServerSingleton;

/// PtyBridge - browser terminals backed by real shells.
#[derive(Parser, Debug)]
#[command(name = "ptybridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving terminals
    Start {
        /// Address to listen on (overrides config and environment)
        #[arg(long, short, value_name = "ADDR")]
        bind: Option<String>,

        /// Accept upgrades only from this origin (repeatable)
        #[arg(long = "allow-origin", value_name = "ORIGIN")]
        allow_origin: Vec<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    let env_overrides = config.apply_env_overrides();

    if let Commands::Start { bind, allow_origin } = &cli.command {
        apply_start_overrides(&mut config, bind.clone(), allow_origin.clone());
    }

    let _log_guard = logging::init(
        &config.daemon.log_level,
        cli.verbose,
        config.daemon.log_dir.as_deref(),
    );

    for applied in &env_overrides {
        tracing::info!(var = applied.var, value = %applied.value, "Applied environment override");
    }

    match cli.command {
        Commands::Start { .. } => run_start(config).await,
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            init_config_file(&config_path, force)?;
            println!("Wrote default configuration to {}", config_path.display());
            Ok(())
        }
    }
}

/// Applies `start` flags on top of file and environment values.
fn apply_start_overrides(config: &mut Config, bind: Option<String>, allow_origin: Vec<String>) {
    if let Some(addr) = bind {
        config.server.bind_addr = addr;
    }
    if !allow_origin.is_empty() {
        config.server.allowed_origins = allow_origin;
    }
}

/// Writes the default configuration, refusing to clobber without `force`.
fn init_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)
}

async fn run_start(config: Config) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;

    tracing::info!("PtyBridge daemon starting...");

    if let Err(e) = which::which(default_shell()) {
        tracing::warn!(
            shell = default_shell(),
            error = %e,
            "Shell not found in PATH; sessions will fail to start"
        );
    }

    if config.server.allowed_origins.is_empty() {
        tracing::warn!(
            bind_addr = %config.server.bind_addr,
            "Terminal endpoint accepts any origin without authentication; anyone who can reach it gets a shell"
        );
    }

    let server = ServerSingleton::global()
        .get_or_create(&config.server)
        .await
        .context("Failed to start bridge server")?;

    tracing::info!(url = %server.endpoint_url(), "Ready for terminal connections");

    wait_for_shutdown_signal().await?;
    server.shutdown().await;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }

    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}
