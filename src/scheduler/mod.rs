//! Cycle scheduling: the main trading loop.
//!
//! Each cycle runs shortly after a candle close:
//! ledger sync → orphan cleanup → window check → positions → capital →
//! signal fan-out → banding → selection → action fan-out → summary.
//! Between cycles the reconciliation monitor runs on a fixed interval.

mod window;

pub use window::{is_within_trading_window, next_candle_close};

use crate::config::{Config, PortfolioConfig, SchedulerConfig};
use crate::exchange::{ExchangeGateway, PositionBook};
use crate::persistence::LedgerStore;
use crate::risk::{MonitorReport, ReconciliationMonitor};
use crate::signal::SignalProvider;
use crate::strategy::{
    EdgeSignal, ExecutionEngine, ExecutionPlan, ExecutionResult, PlannedAction,
    PortfolioSelector, Side, SignalAggregator, TradeDecision,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// What happened in one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub orphans_cleaned: usize,
    pub positions_held: usize,
    pub capital: Decimal,
    pub signals: usize,
    pub failed_symbols: Vec<String>,
    pub decisions: Vec<TradeDecision>,
    pub results: Vec<(String, ExecutionResult)>,
}

impl CycleSummary {
    pub fn count<F: Fn(&ExecutionResult) -> bool>(&self, pred: F) -> usize {
        self.results.iter().filter(|(_, r)| pred(r)).count()
    }
}

/// Drives cycles and the monitor until shutdown.
pub struct CycleScheduler {
    gateway: Arc<dyn ExchangeGateway>,
    provider: Arc<dyn SignalProvider>,
    aggregator: SignalAggregator,
    selector: PortfolioSelector,
    engine: Arc<ExecutionEngine>,
    monitor: ReconciliationMonitor,
    portfolio: PortfolioConfig,
    timing: SchedulerConfig,
    live: bool,
    shutdown: Arc<AtomicBool>,
}

impl CycleScheduler {
    /// `live = false` runs everything up to selection and places no orders.
    pub fn new(
        config: &Config,
        gateway: Arc<dyn ExchangeGateway>,
        provider: Arc<dyn SignalProvider>,
        ledger: Arc<dyn LedgerStore>,
        live: bool,
    ) -> Self {
        let engine = ExecutionEngine::new(
            gateway.clone(),
            ledger.clone(),
            config.execution.clone(),
            config.banding.sl_atr_multiplier,
        );
        let monitor = ReconciliationMonitor::new(gateway.clone(), ledger, config.monitor.clone());

        Self {
            gateway,
            provider,
            aggregator: SignalAggregator::new(config.banding.clone()),
            selector: PortfolioSelector::new(config.portfolio.clone()),
            engine: Arc::new(engine),
            monitor,
            portfolio: config.portfolio.clone(),
            timing: config.scheduler.clone(),
            live,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the loop; every sleep observes it.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            live = self.live,
            symbols = self.portfolio.symbols.len(),
            candle_hours = self.timing.candle_hours,
            "🚀 Starting scheduler"
        );

        if let Err(e) = self.monitor.sync_ledger().await {
            warn!(error = %e, "Startup ledger sync failed");
        }

        while !self.is_shutdown() {
            match self.run_cycle(true).await {
                Ok(Some(summary)) => log_summary(&summary),
                Ok(None) => debug!("Outside trading window"),
                Err(e) => {
                    error!(error = ?e, cooldown_secs = self.timing.error_cooldown_secs, "❌ Cycle failed");
                    self.sleep(Duration::from_secs(self.timing.error_cooldown_secs)).await;
                    continue;
                }
            }

            let resume_at = next_candle_close(Utc::now(), self.timing.candle_hours)
                + chrono::Duration::seconds(self.timing.post_close_buffer_secs as i64);
            self.monitor_until(resume_at).await;
        }

        info!("🛑 Scheduler stopped");
        Ok(())
    }

    /// Run one cycle now. With `enforce_window`, returns `None` outside the window.
    pub async fn run_cycle(&self, enforce_window: bool) -> Result<Option<CycleSummary>> {
        self.cycle_at(Utc::now(), enforce_window).await
    }

    /// One monitor pass, skipped in dry-run mode.
    pub async fn run_monitor_pass(&self) -> Result<MonitorReport> {
        if !self.live {
            debug!("Dry run, monitor pass skipped");
            return Ok(MonitorReport::default());
        }
        self.monitor.run_pass().await
    }

    async fn cycle_at(&self, now: DateTime<Utc>, enforce_window: bool) -> Result<Option<CycleSummary>> {
        let mut summary = CycleSummary {
            started_at: Some(now),
            dry_run: !self.live,
            ..CycleSummary::default()
        };

        if let Err(e) = self.monitor.sync_ledger().await {
            warn!(error = %e, "Ledger sync failed");
        }

        if self.live {
            summary.orphans_cleaned = self.monitor.cleanup_orphans().await?.len();
        }

        if enforce_window
            && !is_within_trading_window(
                now,
                self.timing.candle_hours,
                self.timing.window_tolerance_minutes,
            )
        {
            return Ok(None);
        }

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(dry_run = summary.dry_run, "🔄 [CYCLE] Starting");

        let positions = self
            .gateway
            .get_positions()
            .await
            .context("Failed to fetch positions")?;
        let book = Arc::new(PositionBook::from_positions(positions));
        summary.positions_held = book.len();

        let balances = self
            .gateway
            .get_balances()
            .await
            .context("Failed to fetch balances")?;
        let wallet = balances
            .iter()
            .find(|b| b.asset == self.portfolio.quote_asset)
            .map(|b| b.balance)
            .unwrap_or_else(|| {
                warn!(asset = %self.portfolio.quote_asset, "No quote balance found");
                Decimal::ZERO
            });
        summary.capital = self.selector.deployable_capital(wallet);
        info!(%wallet, capital = %summary.capital, held = book.len(), "💰 [CAPITAL]");

        let (signals, failed) = self.fetch_signals().await;
        summary.signals = signals.len();
        summary.failed_symbols = failed;

        summary.decisions = signals
            .iter()
            .map(|s| self.aggregator.decide(s, book.amount(&s.symbol)))
            .collect();
        let actionable = summary
            .decisions
            .iter()
            .filter(|d| d.side != Side::Neutral)
            .count();
        info!(signals = signals.len(), actionable, "📡 [SIGNAL] Decisions ready");

        let plan = self.selector.select(&summary.decisions, &book, summary.capital);

        summary.results = if self.live {
            self.execute_plan(&plan, book).await
        } else {
            dry_run_results(&plan)
        };

        Ok(Some(summary))
    }

    /// Pool A: signal and funding fetch per symbol. Failing symbols are excluded.
    async fn fetch_signals(&self) -> (Vec<EdgeSignal>, Vec<String>) {
        let semaphore = Arc::new(Semaphore::new(self.portfolio.signal_workers.max(1)));
        let mut handles = Vec::with_capacity(self.portfolio.symbols.len());

        for symbol in &self.portfolio.symbols {
            let sem = semaphore.clone();
            let provider = self.provider.clone();
            let gateway = self.gateway.clone();
            let symbol = symbol.clone();

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.context("Signal pool closed")?;

                let signal = provider.get_signal(&symbol).await?;
                // No funding data means no veto, never a dropped signal.
                let funding_rate = match gateway.get_funding_rate(&symbol).await {
                    Ok(rate) => rate,
                    Err(e) => {
                        warn!(%symbol, error = %e, "Funding rate unavailable, assuming zero");
                        Decimal::ZERO
                    }
                };

                Ok::<_, anyhow::Error>(EdgeSignal {
                    symbol,
                    edge: signal.edge,
                    volatility: signal.volatility,
                    atr: signal.atr,
                    funding_rate,
                })
            }));
        }

        let mut signals = Vec::new();
        let mut failed = Vec::new();
        for (symbol, joined) in self.portfolio.symbols.iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(signal)) => signals.push(signal),
                Ok(Err(e)) => {
                    warn!(%symbol, error = %e, "Signal unavailable, excluding symbol");
                    failed.push(symbol.clone());
                }
                Err(e) => {
                    error!(%symbol, error = %e, "Signal task panicked");
                    failed.push(symbol.clone());
                }
            }
        }

        (signals, failed)
    }

    /// Pool B: one task per planned action.
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        book: Arc<PositionBook>,
    ) -> Vec<(String, ExecutionResult)> {
        let semaphore = Arc::new(Semaphore::new(self.portfolio.execution_workers.max(1)));
        let mut handles = Vec::with_capacity(plan.len());

        for action in &plan.actions {
            let sem = semaphore.clone();
            let engine = self.engine.clone();
            let book = book.clone();
            let action = action.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return ExecutionResult::Failed {
                        reason: "execution pool closed".to_string(),
                    };
                };
                engine.execute(&action, &book).await
            }));
        }

        let symbols = plan.actions.iter().map(|a| a.symbol().to_string());
        symbols
            .zip(join_all(handles).await)
            .map(|(symbol, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    error!(%symbol, error = %e, "Execution task panicked");
                    ExecutionResult::Failed {
                        reason: format!("task panicked: {e}"),
                    }
                });
                (symbol, result)
            })
            .collect()
    }

    /// Run monitor passes until `deadline` or shutdown.
    async fn monitor_until(&self, deadline: DateTime<Utc>) {
        let interval = Duration::from_secs(self.timing.monitor_interval_secs.max(1));
        info!(resume_at = %deadline, "⏳ Monitoring until next cycle");

        while !self.is_shutdown() && Utc::now() < deadline {
            match self.run_monitor_pass().await {
                Ok(report) if !report.tightened.is_empty() => {
                    info!(tightened = ?report.tightened, "🛡️ [MONITOR] Stops moved to breakeven")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Monitor pass failed"),
            }

            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            self.sleep(interval.min(remaining)).await;
        }
    }

    async fn sleep(&self, duration: Duration) {
        let wake = tokio::time::Instant::now() + duration;
        while !self.is_shutdown() {
            let now = tokio::time::Instant::now();
            if now >= wake {
                break;
            }
            tokio::time::sleep((wake - now).min(SHUTDOWN_POLL)).await;
        }
    }
}

fn dry_run_results(plan: &ExecutionPlan) -> Vec<(String, ExecutionResult)> {
    plan.actions
        .iter()
        .map(|action| {
            match action {
                PlannedAction::Close { symbol, reason } => {
                    info!(%symbol, %reason, "[DRY RUN] Would close")
                }
                PlannedAction::Open(open) => info!(
                    symbol = %open.symbol,
                    side = %open.side,
                    leverage = open.leverage,
                    notional = %open.notional,
                    "[DRY RUN] Would open"
                ),
            }
            (
                action.symbol().to_string(),
                ExecutionResult::Skipped {
                    reason: "dry run".to_string(),
                },
            )
        })
        .collect()
}

/// Log every action outcome of a cycle.
pub fn log_summary(summary: &CycleSummary) {
    for (symbol, result) in &summary.results {
        match result {
            ExecutionResult::Failed { .. } => warn!(%symbol, %result, "Action result"),
            _ => info!(%symbol, %result, "Action result"),
        }
    }

    info!(
        dry_run = summary.dry_run,
        signals = summary.signals,
        failed_signals = summary.failed_symbols.len(),
        orphans_cleaned = summary.orphans_cleaned,
        opened = summary.count(|r| matches!(r, ExecutionResult::Opened { .. })),
        closed = summary.count(|r| matches!(r, ExecutionResult::Closed { .. })),
        held = summary.count(|r| matches!(r, ExecutionResult::Held)),
        skipped = summary.count(|r| matches!(r, ExecutionResult::Skipped { .. })),
        failed = summary.count(|r| matches!(r, ExecutionResult::Failed { .. })),
        "📊 [CYCLE] Complete"
    );
}
