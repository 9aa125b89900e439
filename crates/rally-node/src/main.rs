//! Rally CLI
//!
//! Command-line interface for running the reward engine.

use clap::{Parser, Subcommand};
use rally_node::{node::shutdown_signal, NodeConfig, RallyNode};
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rally")]
#[command(version)]
#[command(about = "Rally - engagement rewards for Discord and Telegram communities", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reward engines
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "rally.toml")]
        config: PathBuf,

        /// JSON-lines input, overrides `ingest.input`; `-` reads stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the default configuration
    Init,
    /// Load and validate a configuration file
    Check {
        #[arg(short, long, default_value = "rally.toml")]
        config: PathBuf,
    },
}

fn init_logging(verbose: bool, level: &str, format: &str) {
    let default_level = if verbose { "debug" } else { level };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, input } => {
            let mut node_config = NodeConfig::load(Some(&config))?;
            init_logging(cli.verbose, &node_config.logging.level, &node_config.logging.format);

            if let Some(input) = input {
                node_config.ingest.input = Some(input);
            }
            tracing::info!("Config: {:?}", config);

            let credentials = node_config.resolve_credentials(|name| std::env::var(name).ok())?;
            let input = node_config
                .ingest
                .input
                .clone()
                .filter(|path| path.as_os_str() != "-");
            let node = RallyNode::new(node_config, credentials)?;

            let report = match input {
                Some(path) => {
                    tracing::info!("Reading events from {:?}", path);
                    let file = tokio::fs::File::open(&path).await?;
                    node.run(BufReader::new(file), tokio::io::stdout(), shutdown_signal())
                        .await?
                }
                None => {
                    node.run(
                        BufReader::new(tokio::io::stdin()),
                        tokio::io::stdout(),
                        shutdown_signal(),
                    )
                    .await?
                }
            };

            if let Some(stats) = &report.ingest {
                tracing::info!(lines = stats.lines, routed = stats.routed, "Input processed");
            }
            for (platform, flush) in &report.final_flushes {
                tracing::info!(%platform, committed = flush.committed, "Final flush");
            }
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init => {
                print!("{}", NodeConfig::default_toml()?);
            }
            ConfigCommands::Check { config } => {
                let node_config = NodeConfig::load(Some(&config))?;
                let enabled: Vec<_> = node_config
                    .enabled_platforms()
                    .map(|p| p.platform.to_string())
                    .collect();
                println!("Configuration OK");
                println!("Platforms: {}", enabled.join(", "));
                println!(
                    "Batch: {} users / {}s",
                    node_config.engine.batch.batch_size, node_config.engine.batch.flush_interval_secs
                );
                if node_config.metrics.enabled {
                    println!("Metrics: {}", node_config.metrics.address);
                } else {
                    println!("Metrics: disabled");
                }
            }
        },
    }

    Ok(())
}
