use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tradewind",
    about = "Automated trading orchestration engine",
    version
)]
pub struct Cli {
    /// Configuration directory (default.toml plus environment overlay)
    #[arg(long, default_value = "config", global = true)]
    pub config_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestration engine: scheduler, stream hub and endpoints
    Run {
        /// Use the in-process paper broker instead of the live API
        #[arg(long)]
        dry_run: bool,
    },
    /// Run only the market data stream hub and WebSocket endpoint
    Stream,
    /// Print the account snapshot and open positions
    Account,
    /// Load configuration, validate it and exit
    CheckConfig,
}
