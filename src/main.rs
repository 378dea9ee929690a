//! Bracket Trader - Main Entry Point
//!
//! Places no orders unless `LIVE_TRADING=true`.

use anyhow::{Context, Result};
use bracket_trader::config::Config;
use bracket_trader::exchange::BinanceClient;
use bracket_trader::persistence::{LedgerStore, SqliteLedger};
use bracket_trader::scheduler::{log_summary, CycleScheduler};
use bracket_trader::signal::{HttpSignalProvider, SignalProvider, StaticSignalProvider};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Bracket Trader CLI
#[derive(Parser)]
#[command(name = "bracket-trader")]
#[command(version, about = "Banded bracket-order trading on Binance futures")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the candle-aligned trading loop (default)
    Run {
        /// JSON file of static signals instead of the model service
        #[arg(short, long)]
        signals: Option<String>,
    },

    /// Run one cycle immediately, ignoring the trading window
    Once {
        /// JSON file of static signals instead of the model service
        #[arg(short, long)]
        signals: Option<String>,
    },

    /// Run a single reconciliation monitor pass
    Monitor,

    /// Show recent orders, brackets and balances from the ledger
    Status {
        /// Path to SQLite ledger (default: configured ledger path)
        #[arg(short, long)]
        db: Option<String>,

        /// Number of recent orders to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load().context("Failed to load configuration")?;

    let command = cli.command.unwrap_or(Commands::Run { signals: None });
    if let Commands::Status { db, limit } = &command {
        let path = db.as_deref().unwrap_or(&config.ledger.path);
        return show_status(path, *limit);
    }

    config.validate().context("Invalid configuration")?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║              Bracket Trader v{}                          ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let live = std::env::var("LIVE_TRADING").unwrap_or_default() == "true";
    if live {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
    } else {
        info!("📝 DRY RUN MODE - signals and selections are logged, no orders placed");
    }
    log_config(&config);

    match command {
        Commands::Run { signals } => {
            let scheduler = build_scheduler(&config, signals.as_deref(), live)?;

            let shutdown = scheduler.shutdown_handle();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("🛑 Shutdown signal received");
                shutdown.store(true, Ordering::SeqCst);
            });

            scheduler.run().await
        }
        Commands::Once { signals } => {
            let scheduler = build_scheduler(&config, signals.as_deref(), live)?;
            if let Some(summary) = scheduler.run_cycle(false).await? {
                log_summary(&summary);
            }
            Ok(())
        }
        Commands::Monitor => {
            let scheduler = build_scheduler(&config, None, live)?;
            let report = scheduler.run_monitor_pass().await?;
            info!(
                checked = report.positions_checked,
                tightened = ?report.tightened,
                failures = ?report.failures,
                "🛡️ Monitor pass complete"
            );
            Ok(())
        }
        Commands::Status { .. } => Ok(()),
    }
}

/// Wire the gateway, signal source and ledger into a scheduler.
fn build_scheduler(config: &Config, signals: Option<&str>, live: bool) -> Result<CycleScheduler> {
    let gateway = Arc::new(BinanceClient::new(&config.binance)?);
    if config.binance.testnet {
        info!("🧪 Using Binance futures testnet");
    }

    let provider: Arc<dyn SignalProvider> = match signals {
        Some(path) => {
            info!(%path, "Using static signals");
            Arc::new(StaticSignalProvider::from_file(path)?)
        }
        None => Arc::new(HttpSignalProvider::new(&config.signal)?),
    };

    let ledger = Arc::new(
        SqliteLedger::new(&config.ledger.path)
            .with_context(|| format!("Failed to open ledger at {}", config.ledger.path))?,
    );

    Ok(CycleScheduler::new(config, gateway, provider, ledger, live))
}

/// Initialize logging to stdout and an hourly rolled file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "bracket-trader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("bracket_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Symbols: {} (max {} positions)",
        config.portfolio.symbols.len(),
        config.portfolio.max_positions
    );
    info!(
        "   Capital Utilization: {:.0}%",
        config.portfolio.capital_utilization * Decimal::ONE_HUNDRED
    );
    for (i, band) in config.banding.bands.iter().enumerate() {
        let upper = band
            .upper
            .map(|u| u.to_string())
            .unwrap_or_else(|| "∞".to_string());
        info!(
            "   Band {}: [{}, {}) → {}x, TP {:?} ATR",
            i + 1,
            band.lower,
            upper,
            band.leverage,
            band.tp_atr
        );
    }
    info!(
        "   Stop: {} ATR, funding cap {}%",
        config.banding.sl_atr_multiplier, config.banding.max_funding_rate_pct
    );
    info!(
        "   Cycle: every {}h, window {}m, monitor every {}s",
        config.scheduler.candle_hours,
        config.scheduler.window_tolerance_minutes,
        config.scheduler.monitor_interval_secs
    );
    info!(
        "   Entry: {} ATR passive offset, {}s fill timeout",
        config.execution.entry_offset_atr,
        config.execution.fill_timeout_ms / 1000
    );
}

/// Print ledger contents.
fn show_status(db_path: &str, limit: usize) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              BRACKET TRADER LEDGER                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Ledger not found: {}", db_path);
        println!("   The trader has not been started yet, or the ledger path is incorrect.");
        return Ok(());
    }

    let ledger = SqliteLedger::new(db_path)?;

    let balances = ledger.recent_balances(5)?;
    if !balances.is_empty() {
        println!("\n💰 Recent Balances");
        for b in &balances {
            println!(
                "   ├─ {} {}: {:.2} (uPnL {:.2})",
                b.timestamp.format("%Y-%m-%d %H:%M"),
                b.asset,
                b.wallet_balance,
                b.unrealized_pnl
            );
        }
    }

    let brackets = ledger.brackets()?;
    println!("\n🎯 Brackets ({})", brackets.len());
    for b in &brackets {
        println!(
            "   ├─ {} {} @ {} (ATR {}, {} TP legs) since {}",
            b.symbol,
            b.side,
            b.entry_price,
            b.atr,
            b.planned_tp_legs,
            b.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    let orders = ledger.recent_orders(limit)?;
    println!("\n📜 Recent Orders ({})", orders.len());
    for o in &orders {
        println!(
            "   ├─ {} {} {} {} {} @ {} x{} [{}]",
            o.updated_at.format("%Y-%m-%d %H:%M:%S"),
            o.symbol,
            o.side,
            o.order_type,
            o.quantity,
            o.price,
            o.leverage,
            o.status
        );
    }

    println!();
    Ok(())
}
