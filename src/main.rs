use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::{
    app::App,
    config::{ExporterConfig, Overrides},
    proc::{MatchStrategy, ProcessTableKind},
};

pub mod app;
pub mod config;
pub mod metrics;
pub mod proc;
pub mod rpc;
pub mod server;

/// Prometheus exporter for Ethereum client metrics and process start times
#[derive(Parser, Debug)]
#[command(about, version)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = config::DEFAULT_FILE)]
    config: PathBuf,
    /// Ethereum JSON-RPC URL
    #[arg(long)]
    url: Option<String>,
    /// Listen address
    #[arg(long)]
    addr: Option<String>,
    /// Comma-separated list of process names to monitor start times
    #[arg(long, value_name = "LIST")]
    processes: Option<String>,
    /// Enable EVM node collectors (block number, timestamp)
    #[arg(long)]
    evm: bool,
    /// Enable full Ethereum node collectors (all metrics)
    #[arg(long)]
    eth: bool,
    /// How process names are matched
    #[arg(long = "match", value_enum)]
    match_strategy: Option<MatchStrategy>,
    /// Where the process list comes from
    #[arg(long, value_enum)]
    process_table: Option<ProcessTableKind>,
    /// Kernel clock ticks per second
    #[arg(long)]
    clock_ticks: Option<u64>,
    /// procfs mount point
    #[arg(long, value_name = "DIR")]
    proc_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve metrics over HTTP
    Serve,
    /// Validate the configuration
    Validate,
    /// Print the effective configuration
    Config,
    /// List the metrics that would be exported
    Describe,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            addr: self.addr.clone(),
            processes: self.processes.clone(),
            evm: self.evm,
            eth: self.eth,
            match_strategy: self.match_strategy,
            process_table: self.process_table,
            clock_ticks: self.clock_ticks,
            proc_root: self.proc_root.clone(),
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging();
    let config = ExporterConfig::load(&cli.config, cli.overrides())?;
    match &cli.command {
        Some(Commands::Config) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Some(Commands::Validate) => {
            App::new(config)?;
            println!("Configuration OK");
            Ok(())
        }
        Some(Commands::Describe) => {
            print!("{}", App::new(config)?.describe());
            Ok(())
        }
        Some(Commands::Serve) | None => {
            info!("Ethereum exporter {} starting", env!("CARGO_PKG_VERSION"));
            App::new(config)?.run().await
        }
    }
}
