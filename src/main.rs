use anyhow::Context;
use clap::Parser;
use tradedesk::cli::{Cli, Commands};
use tradedesk::config::AppConfig;

mod main_runtime;

use main_runtime::{init_logging, print_breaker, print_report};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Err(errors) = config.validate() {
        anyhow::bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }
    let _log_guard = init_logging(&config.logging);

    match cli.command {
        Commands::Run { date, fixture, json } => {
            let report = main_runtime::run_cycle(&config, date, &fixture).await?;
            print_report(&report, json)?;
            if report.status == tradedesk::CycleStatus::Aborted {
                anyhow::bail!(
                    "cycle for {} aborted: {}",
                    date,
                    report.abort_reason.unwrap_or_default()
                );
            }
        }
        Commands::Status { date } => match main_runtime::last_report(&config, date).await? {
            Some(report) => print_report(&report, false)?,
            None => println!("No cycle recorded for {}", date),
        },
        Commands::Halt { reason } => {
            let state = main_runtime::force_halt(&config, &reason).await?;
            print_breaker(&state)?;
        }
        Commands::ClearHalt => {
            let state = main_runtime::clear_halt(&config).await?;
            print_breaker(&state)?;
        }
        Commands::Breaker => {
            let state = main_runtime::breaker(&config).await?;
            print_breaker(&state)?;
        }
    }
    Ok(())
}
