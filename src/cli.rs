use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tradedesk")]
#[command(version = "0.1.0")]
#[command(about = "Daily multi-agent trading decision pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus $TRADEDESK_ENV.toml)
    #[arg(short, long, default_value = "config", env = "TRADEDESK_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the cycle for one trading date against a market fixture
    Run {
        /// Trading date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
        /// Fixture JSON with the portfolio and data sources
        #[arg(long)]
        fixture: PathBuf,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the last recorded report for a trading date
    Status {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Raise the emergency halt (persisted in the breaker state)
    Halt {
        #[arg(long)]
        reason: String,
    },
    /// Clear a previous emergency halt
    ClearHalt,
    /// Show the circuit breaker state
    Breaker,
}
