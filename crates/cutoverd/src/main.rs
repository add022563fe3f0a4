//! cutoverd: the cutover daemon.
//!
//! Single binary that assembles the deployer:
//! - State store (redb)
//! - Deployment event log + wake-up notifier
//! - Deployment work queue + rollout worker
//! - REST API + live event stream
//!
//! # Usage
//!
//! ```text
//! cutoverd serve --config /etc/cutover/cutover.toml --port 8443
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::daemon::{load_config, run_daemon};

#[derive(Parser)]
#[command(name = "cutoverd", about = "cutover deployment daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server and rollout worker.
    Serve {
        /// Path to cutover.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML.
    Config {
        /// Path to cutover.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cutoverd=debug,cutover=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let config = load_config(config.as_deref(), port, data_dir)?;
            run_daemon(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref(), None, None)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
