use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::future::Future;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::adapter::AlgoOrderAdapter;
use crate::audit::{audit_candle_gaps, CandleSelector, GapReport, JsonFileCandleSource, TimeRange};
use crate::config::AdapterConfig;
use crate::domain::{timeframe_width, DomainEvent};
use crate::error::{AdapterError, Result};

#[derive(Parser)]
#[command(name = "venue-adapter")]
#[command(version)]
#[command(about = "Venue connectivity, algo order adapter and candle gap audit", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and <env>.toml
    #[arg(short, long, default_value = "config", global = true)]
    pub config_dir: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect, subscribe to one channel and log domain events until Ctrl+C
    Run {
        /// Channel type, e.g. trades, ticker, book
        #[arg(long, default_value = "trades")]
        channel: String,
        /// Symbol filter, e.g. tBTCUSD
        #[arg(long, default_value = "tBTCUSD")]
        symbol: String,
    },
    /// List supported candle timeframes
    Timeframes,
    /// Audit a candle series stored in a JSON file for gaps
    Audit {
        /// JSON array of candles
        #[arg(long)]
        file: String,
        #[arg(long, default_value = "bitfinex")]
        exchange: String,
        #[arg(long)]
        symbol: String,
        /// Timeframe code, e.g. 1h
        #[arg(long)]
        tf: String,
        /// Range start (ms, inclusive)
        #[arg(long)]
        start: Option<i64>,
        /// Range end (ms, inclusive)
        #[arg(long)]
        end: Option<i64>,
    },
}

pub fn print_timeframes() {
    println!("{:<12} {:<6} {:>14}", "LABEL", "CODE", "WIDTH (ms)");
    for (label, code) in AlgoOrderAdapter::time_frames() {
        let width = timeframe_width(code).unwrap_or_default();
        println!("{:<12} {:<6} {:>14}", label, code, width);
    }
}

pub async fn run_audit(
    file: &str,
    selector: &CandleSelector,
    range: TimeRange,
) -> Result<GapReport> {
    let source = JsonFileCandleSource::open(file).await?;
    let report = audit_candle_gaps(&source, selector, range).await?;

    println!(
        "{} {} {}: {} candles, {} gaps",
        selector.exchange,
        selector.symbol,
        selector.tf,
        report.candles.len(),
        report.gaps.len()
    );

    if report.has_gaps() {
        let width = timeframe_width(&selector.tf)
            .ok_or_else(|| AdapterError::UnknownTimeframe(selector.tf.clone()))?;
        for range in report.missing_ranges(width) {
            println!(
                "  gap after {} before {} ({} missing)",
                range.after_mts, range.before_mts, range.missing_count
            );
        }
    }

    Ok(report)
}

/// Connect, subscribe and log events until `shutdown` resolves
pub async fn run_feed<F>(config: AdapterConfig, channel: &str, symbol: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let adapter = AlgoOrderAdapter::with_ws_pool(config)?;
    let mut events = adapter.subscribe_events();

    adapter.connect().await?;
    let connection = adapter.get_connection()?;

    let mut filter = Map::new();
    filter.insert("symbol".to_string(), Value::String(symbol.to_string()));
    adapter.subscribe(&connection, channel, &filter).await?;
    info!("Subscribed to {} {}", channel, symbol);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    adapter.disconnect().await
}

fn log_event(event: &DomainEvent) {
    match event {
        DomainEvent::Data { data, meta, .. } => {
            info!(event = event.name(), %meta, %data);
        }
        DomainEvent::MetaError(fault) => warn!(event = event.name(), %fault),
        DomainEvent::ConnectionUpdate { index, state } => {
            info!(event = event.name(), index, state = %state);
        }
        DomainEvent::OrderNew {
            payload,
            valid: false,
        }
        | DomainEvent::OrderUpdate {
            payload,
            valid: false,
        }
        | DomainEvent::OrderClose {
            payload,
            valid: false,
        } => {
            warn!(event = event.name(), %payload, "order event during restart window");
        }
        other => info!(event = other.name(), "{:?}", other),
    }
}
