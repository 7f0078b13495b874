mod config;
mod database;
mod engine;
mod error;
mod exchange;
mod indicators;
mod strategies;
mod types;
mod web;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Settings;
use database::Database;
use engine::{DownloadEngine, LiveTracker, SignalScanner};
use exchange::BinanceClient;
use types::Interval;
use web::AppState;

#[derive(Parser)]
#[command(name = "trading-lab")]
#[command(version = "0.1.0")]
#[command(about = "Trading-signal laboratory: klines downloader, live scanner/tracker, backtests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server with the signal scanner and live tracker
    Serve {
        /// Port override (default from PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Host override (default from HOST)
        #[arg(long)]
        host: Option<String>,
    },
    /// Download klines for a range and wait for the job to finish
    Download {
        #[arg(short, long)]
        symbol: String,
        #[arg(short, long, default_value = "1h")]
        interval: String,
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// End date (YYYY-MM-DD, inclusive)
        #[arg(long)]
        end: String,
    },
    /// Run a backtest over stored candles and print the summary
    Backtest {
        #[arg(short, long)]
        symbol: String,
        #[arg(short, long, default_value = "1h")]
        interval: String,
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// End date (YYYY-MM-DD, inclusive)
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "breakout")]
        strategy: String,
        /// Strategy params as a JSON object
        #[arg(long)]
        params: Option<String>,
        #[arg(long, default_value = "10000")]
        capital: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::from_env();

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port, host } => {
            let port = port.unwrap_or(settings.port);
            let host = host.unwrap_or_else(|| settings.host.clone());
            run_serve(&settings, host, port).await?;
        }
        Commands::Download {
            symbol,
            interval,
            start,
            end,
        } => {
            run_download(&settings, &symbol, &interval, &start, &end).await?;
        }
        Commands::Backtest {
            symbol,
            interval,
            start,
            end,
            strategy,
            params,
            capital,
        } => {
            run_backtest_cmd(&settings, &symbol, &interval, &start, &end, &strategy, params, capital).await?;
        }
    }

    Ok(())
}

async fn run_serve(settings: &Settings, host: String, port: u16) -> Result<()> {
    info!("trading-lab v0.1.0");

    let db = Database::connect(&settings.effective_database_url()).await?;
    let client = Arc::new(BinanceClient::new());
    let downloads = DownloadEngine::new(db.clone(), Arc::clone(&client));

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let scanner = SignalScanner::new(db.clone(), Arc::clone(&downloads));
    let scanner_handle = tokio::spawn(scanner.run(shutdown_tx.subscribe()));

    let tracker = LiveTracker::new(db.clone(), Arc::clone(&client), Arc::clone(&downloads));
    let tracker_handle = tokio::spawn(tracker.run(shutdown_tx.subscribe()));

    let state = AppState::new(db, client, downloads);
    let server_rx = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move { web::serve(state, &host, port, server_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    let _ = shutdown_tx.send(());

    // terminate the engine loops first, then the HTTP server
    let _ = scanner_handle.await;
    let _ = tracker_handle.await;
    if let Ok(Err(err)) = server_handle.await {
        return Err(anyhow!("server error: {err}"));
    }

    Ok(())
}

async fn run_download(settings: &Settings, symbol: &str, interval: &str, start: &str, end: &str) -> Result<()> {
    let interval: Interval = interval.parse().map_err(|e| anyhow!("{e}"))?;
    let start_ms = parse_date_ms(start)?;
    let end_ms = parse_date_ms(end)? + types::MS_PER_DAY; // inclusive end day

    let db = Database::connect(&settings.effective_database_url()).await?;
    let client = Arc::new(BinanceClient::new());
    let downloads = DownloadEngine::new(db.clone(), Arc::clone(&client));

    let symbol = symbol.to_uppercase();
    let job_id = db.create_job(&symbol, interval.as_str(), start_ms, end_ms).await?;
    info!("Job {} created for {} {} [{} .. {})", job_id, symbol, interval, start_ms, end_ms);

    downloads.run_job(job_id).await;

    let job = db
        .get_job(job_id)
        .await?
        .ok_or_else(|| anyhow!("job {job_id} disappeared"))?;
    info!(
        "Job {} finished: status={:?} downloaded={}/{} gaps={}",
        job_id, job.status, job.candles_downloaded, job.candles_expected, job.gaps_found
    );

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_backtest_cmd(
    settings: &Settings,
    symbol: &str,
    interval: &str,
    start: &str,
    end: &str,
    strategy: &str,
    params: Option<String>,
    capital: f64,
) -> Result<()> {
    let interval: Interval = interval.parse().map_err(|e| anyhow!("{e}"))?;
    let start_ms = parse_date_ms(start)?;
    let end_ms = parse_date_ms(end)? + types::MS_PER_DAY;

    let params: serde_json::Value = match params {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| anyhow!("invalid --params JSON: {e}"))?,
        None => serde_json::json!({}),
    };

    let db = Database::connect(&settings.effective_database_url()).await?;
    let result = engine::run_backtest(
        &db,
        &symbol.to_uppercase(),
        interval,
        start_ms,
        end_ms,
        strategy,
        &params,
        capital,
    )
    .await
    .map_err(|e| anyhow!("{e}"))?;

    println!("{}", serde_json::to_string_pretty(&result.summary)?);
    println!(
        "trades: {}  candles: {}  liquidated: {}",
        result.trade_log.len(),
        result.equity_curve.len(),
        result.liquidated
    );

    Ok(())
}

fn parse_date_ms(date: &str) -> Result<i64> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| anyhow!("invalid date {date:?}, use YYYY-MM-DD"))?;
    let midnight = parsed
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("invalid date {date:?}"))?;
    Ok(midnight.and_utc().timestamp_millis())
}
