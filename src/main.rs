use clap::Parser;
use tracing::{error, info};
use venue_adapter::audit::{CandleSelector, TimeRange};
use venue_adapter::cli::{self, Cli, Commands};
use venue_adapter::config::AdapterConfig;

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Timeframes => {
            init_logging_simple();
            cli::print_timeframes();
        }
        Commands::Audit {
            file,
            exchange,
            symbol,
            tf,
            start,
            end,
        } => {
            init_logging_simple();
            let selector = CandleSelector::new(exchange, symbol, tf);
            let range = TimeRange {
                start: *start,
                end: *end,
            };
            cli::run_audit(file, &selector, range).await?;
        }
        Commands::Run { channel, symbol } => {
            let config = AdapterConfig::load_from(&cli.config_dir)?;
            init_logging(&config.logging);
            info!("Starting venue adapter: {:?}", config);

            if let Err(e) = cli::run_feed(config, channel, symbol, shutdown_signal()).await {
                error!("Feed stopped with error: {}", e);
                return Err(e.into());
            }
        }
    }

    Ok(())
}
