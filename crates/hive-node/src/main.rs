//! hive-node - ComputeHive scheduler and marketplace daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hive_node::config::LoggingSection;
use hive_node::{HiveConfig, HiveService, LoggingAgentClient, LoggingPaymentGateway, workers};
use hive_proto::SystemClock;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "hive-node")]
#[command(about = "ComputeHive scheduler and marketplace daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Path to config file; defaults apply when omitted
        #[arg(short, long, env = "HIVE_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Write a config file with every default filled in
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "hive.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a config file and print the effective settings
    CheckConfig {
        /// Path to config file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = match config {
                Some(path) => HiveConfig::from_file(path)?,
                None => HiveConfig::default(),
            };
            init_tracing(&config.logging)?;
            run(config).await?;
        }

        Commands::InitConfig { output, force } => {
            init_tracing(&LoggingSection::default())?;
            if output.exists() && !force {
                anyhow::bail!(
                    "{} already exists, pass --force to overwrite",
                    output.display()
                );
            }
            HiveConfig::default().save(&output)?;
            info!(path = %output.display(), "config written");
        }

        Commands::CheckConfig { config } => {
            let config = HiveConfig::from_file(&config)?;
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingSection) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.filter))?;
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }
    Ok(())
}

async fn run(config: HiveConfig) -> anyhow::Result<()> {
    let service = Arc::new(HiveService::new(
        &config,
        Arc::new(LoggingAgentClient),
        Arc::new(LoggingPaymentGateway),
        Arc::new(SystemClock),
    ));
    let workers = workers::spawn(Arc::clone(&service), (&config.workers).into());
    info!("hive-node running");

    let mut events = service.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutting down");
                break;
            }
            received = events.recv() => match received {
                Ok(envelope) => {
                    let event = serde_json::to_string(&envelope.event)?;
                    debug!(sequence = envelope.sequence, %event, "event");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    workers.stop().await?;
    info!(last_sequence = service.last_sequence(), "hive-node stopped");
    Ok(())
}
