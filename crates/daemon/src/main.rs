//! Podterm Daemon
//!
//! Serves shared container terminals to WebSocket viewers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::container::{DockerBuilder, DockerRuntime, RunJournal};
use daemon::network::Server;
use daemon::session::{ManagerConfig, SessionManager, SessionRegistry};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Podterm Daemon - shared terminals inside source-built containers.
#[derive(Parser, Debug)]
#[command(name = "podterm")]
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

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve viewer connections until interrupted
    Serve {
        /// Address to listen on, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
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

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing; RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            config.validate()?;
            serve(config).await?;
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
            }
            ConfigCommands::Path => {
                println!("{}", config_path.display());
            }
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists: {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                Config::default().save(&config_path)?;
                println!("Wrote default configuration to {}", config_path.display());
            }
        },
    }

    Ok(())
}

/// Run the viewer endpoint until a shutdown signal arrives.
async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Podterm daemon starting...");

    let builder = Arc::new(DockerBuilder::new(
        config.container.docker_binary.clone(),
        config.container.work_dir.clone(),
    ));
    let runtime = Arc::new(DockerRuntime::new(
        config.container.docker_binary.clone(),
        config.container.cols,
        config.container.rows,
    ));
    let journal = Arc::new(RunJournal::in_dir(&config.daemon.data_dir));
    tracing::info!(journal = %journal.path().display(), "Recording container runs");

    let registry = Arc::new(SessionRegistry::new());
    let manager = Arc::new(
        SessionManager::new(registry, builder, runtime, ManagerConfig::from_config(&config))
            .with_hooks(journal),
    );

    let server = Server::bind(config.listen_addr()?, Arc::clone(&manager)).await?;
    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    match server_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "Viewer endpoint failed"),
        Err(e) => tracing::error!(error = %e, "Viewer endpoint task panicked"),
        Ok(Ok(())) => {}
    }

    manager.shutdown().await;
    tracing::info!("Podterm daemon stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

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
