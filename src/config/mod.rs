//! Configuration management for the bracket trader.
//!
//! Loads settings from environment variables and config files.

use crate::exchange::MarginType;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Binance API credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Edge bands, take-profit plans and signal filters
    #[serde(default)]
    pub banding: BandingConfig,
    /// Universe, position cap and sizing
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    /// Order placement parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Cycle timing
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Stop trailing between cycles
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Signal provider endpoint
    #[serde(default)]
    pub signal: SignalConfig,
    /// Order ledger
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

/// One edge band: `[lower, upper)` with its leverage and take-profit multiples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandSpec {
    pub lower: Decimal,
    /// `None` only for the last band.
    #[serde(default)]
    pub upper: Option<Decimal>,
    pub leverage: u8,
    /// One multiple (single target) or three (ladder), in ATR units.
    pub tp_atr: Vec<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandingConfig {
    /// Bands ordered by increasing edge
    #[serde(default = "default_bands")]
    pub bands: Vec<BandSpec>,
    /// Quantity fraction per ladder rung; the remainder runs unbracketed
    #[serde(default = "default_ladder_fractions")]
    pub ladder_fractions: Vec<Decimal>,
    /// Stop distance in ATR units
    #[serde(default = "default_sl_atr_multiplier")]
    pub sl_atr_multiplier: Decimal,
    /// Funding cap in percent (0.04 = 0.04%)
    #[serde(default = "default_max_funding_rate_pct")]
    pub max_funding_rate_pct: Decimal,
    /// Fraction of the band-1 lower bound that keeps an existing position open
    #[serde(default = "default_hysteresis_factor")]
    pub hysteresis_factor: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// Symbol universe scored every cycle
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Maximum number of concurrent positions
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    /// Share of the wallet balance that may be deployed (0.0-1.0)
    #[serde(default = "default_capital_utilization")]
    pub capital_utilization: Decimal,
    /// Floor for a single order notional in USDT
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Asset whose wallet balance funds the portfolio
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Concurrent signal fetches
    #[serde(default = "default_signal_workers")]
    pub signal_workers: usize,
    /// Concurrent order executions
    #[serde(default = "default_execution_workers")]
    pub execution_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_margin_type")]
    pub margin_type: MarginType,
    /// Passive entry offset from mid, in ATR units
    #[serde(default = "default_entry_offset_atr")]
    pub entry_offset_atr: Decimal,
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,
    /// Limit order lifetime before falling back to market
    #[serde(default = "default_fill_timeout_ms")]
    pub fill_timeout_ms: u64,
    /// Attempts for margin/leverage setup and bracket legs
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Candle period in hours
    #[serde(default = "default_candle_hours")]
    pub candle_hours: u32,
    /// Minutes after a candle close during which a cycle may run
    #[serde(default = "default_window_tolerance_minutes")]
    pub window_tolerance_minutes: u32,
    /// Delay past the candle close before the next cycle
    #[serde(default = "default_post_close_buffer_secs")]
    pub post_close_buffer_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Sleep after an error escapes a cycle
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Breakeven stop offset into profit, in ATR units
    #[serde(default = "default_breakeven_buffer_atr")]
    pub breakeven_buffer_atr: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_signal_url")]
    pub base_url: String,
    #[serde(default = "default_signal_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: String,
}

// Default value functions
fn default_bands() -> Vec<BandSpec> {
    vec![
        BandSpec {
            lower: Decimal::new(3, 1), // 0.3
            upper: Some(Decimal::new(4, 1)),
            leverage: 5,
            tp_atr: vec![Decimal::new(3, 1)],
        },
        BandSpec {
            lower: Decimal::new(4, 1),
            upper: Some(Decimal::new(6, 1)),
            leverage: 7,
            tp_atr: vec![Decimal::new(5, 1)],
        },
        BandSpec {
            lower: Decimal::new(6, 1),
            upper: Some(Decimal::ONE),
            leverage: 10,
            tp_atr: vec![Decimal::new(6, 1), Decimal::new(12, 1), Decimal::new(24, 1)],
        },
        BandSpec {
            lower: Decimal::ONE,
            upper: None,
            leverage: 12,
            tp_atr: vec![Decimal::new(8, 1), Decimal::new(15, 1), Decimal::new(30, 1)],
        },
    ]
}

fn default_ladder_fractions() -> Vec<Decimal> {
    vec![Decimal::new(30, 2), Decimal::new(30, 2), Decimal::new(20, 2)]
}

fn default_sl_atr_multiplier() -> Decimal {
    Decimal::new(5, 1) // 0.5 ATR
}

fn default_max_funding_rate_pct() -> Decimal {
    Decimal::new(4, 2) // 0.04%
}

fn default_hysteresis_factor() -> Decimal {
    Decimal::new(5, 1) // half the entry threshold
}

fn default_symbols() -> Vec<String> {
    [
        "BTCUSDT", "ETHUSDT", "BNBUSDT", "XRPUSDT", "ADAUSDT", "SOLUSDT", "DOGEUSDT", "DOTUSDT",
        "AVAXUSDT", "LTCUSDT", "LINKUSDT", "ATOMUSDT", "UNIUSDT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_positions() -> usize {
    5
}

fn default_capital_utilization() -> Decimal {
    Decimal::new(90, 2) // 0.90
}

fn default_min_notional() -> Decimal {
    Decimal::new(6, 0) // 6 USDT
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_signal_workers() -> usize {
    10
}

fn default_execution_workers() -> usize {
    5
}

fn default_margin_type() -> MarginType {
    MarginType::Isolated
}

fn default_entry_offset_atr() -> Decimal {
    Decimal::new(1, 1) // 0.1 ATR
}

fn default_fill_poll_interval_ms() -> u64 {
    5_000
}

fn default_fill_timeout_ms() -> u64 {
    180_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_min_ms() -> u64 {
    1_000
}

fn default_retry_backoff_max_ms() -> u64 {
    2_000
}

fn default_candle_hours() -> u32 {
    4
}

fn default_window_tolerance_minutes() -> u32 {
    45
}

fn default_post_close_buffer_secs() -> u64 {
    120
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_error_cooldown_secs() -> u64 {
    60
}

fn default_breakeven_buffer_atr() -> Decimal {
    Decimal::new(1, 1) // 0.1 ATR
}

fn default_signal_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_signal_timeout_secs() -> u64 {
    30
}

fn default_ledger_path() -> String {
    "data/ledger.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("BTR"))
            .build()
            .context("Failed to build configuration")?;

        let mut config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if config.binance.api_key.is_empty() {
            config.binance.api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
        }
        if config.binance.secret_key.is_empty() {
            config.binance.secret_key = std::env::var("BINANCE_SECRET_KEY").unwrap_or_default();
        }

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        self.banding.validate()?;

        let p = &self.portfolio;
        anyhow::ensure!(!p.symbols.is_empty(), "symbol universe must not be empty");
        anyhow::ensure!(p.max_positions >= 1, "max_positions must be >= 1");
        anyhow::ensure!(
            p.capital_utilization > Decimal::ZERO && p.capital_utilization <= Decimal::ONE,
            "capital_utilization must be between 0 and 1"
        );
        anyhow::ensure!(p.min_notional > Decimal::ZERO, "min_notional must be positive");
        anyhow::ensure!(
            p.signal_workers >= 1 && p.execution_workers >= 1,
            "worker pools must have at least one worker"
        );

        let e = &self.execution;
        anyhow::ensure!(e.retry_attempts >= 1, "retry_attempts must be >= 1");
        anyhow::ensure!(
            e.retry_backoff_min_ms <= e.retry_backoff_max_ms,
            "retry_backoff_min_ms must not exceed retry_backoff_max_ms"
        );
        anyhow::ensure!(
            e.fill_poll_interval_ms > 0 && e.fill_poll_interval_ms <= e.fill_timeout_ms,
            "fill_poll_interval_ms must be positive and not exceed fill_timeout_ms"
        );
        anyhow::ensure!(
            e.entry_offset_atr >= Decimal::ZERO,
            "entry_offset_atr must not be negative"
        );

        let s = &self.scheduler;
        anyhow::ensure!(
            s.candle_hours >= 1 && 24 % s.candle_hours == 0,
            "candle_hours must divide 24"
        );
        anyhow::ensure!(
            s.window_tolerance_minutes >= 1 && s.window_tolerance_minutes <= 60,
            "window_tolerance_minutes must be between 1 and 60"
        );
        anyhow::ensure!(s.monitor_interval_secs > 0, "monitor_interval_secs must be positive");

        anyhow::ensure!(
            self.monitor.breakeven_buffer_atr >= Decimal::ZERO,
            "breakeven_buffer_atr must not be negative"
        );

        Ok(())
    }
}

impl BandingConfig {
    /// Funding cap as a rate (0.04% → 0.0004).
    pub fn max_funding_rate(&self) -> Decimal {
        crate::utils::from_percent(self.max_funding_rate_pct)
    }

    /// Edge magnitude below which an existing position is no longer held.
    pub fn weak_threshold(&self) -> Decimal {
        self.bands
            .first()
            .map(|b| b.lower * self.hysteresis_factor)
            .unwrap_or(Decimal::ZERO)
    }

    /// Reject gaps, overlaps, non-monotonic bounds and malformed ladders.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.bands.is_empty(), "at least one band is required");
        anyhow::ensure!(
            self.bands[0].lower > Decimal::ZERO,
            "band 1 lower bound must be positive"
        );

        for (i, band) in self.bands.iter().enumerate() {
            let n = i + 1;
            anyhow::ensure!(band.leverage >= 1, "band {n}: leverage must be >= 1");

            match (band.upper, self.bands.get(i + 1)) {
                (Some(upper), Some(next)) => {
                    anyhow::ensure!(upper > band.lower, "band {n}: upper must exceed lower");
                    anyhow::ensure!(
                        next.lower == upper,
                        "band {n}: upper {upper} must equal next lower {} (no gaps or overlaps)",
                        next.lower
                    );
                }
                (None, Some(_)) => anyhow::bail!("band {n}: only the last band may be unbounded"),
                (Some(_), None) => anyhow::bail!("band {n}: last band must be unbounded"),
                (None, None) => {}
            }

            anyhow::ensure!(
                band.tp_atr.len() == 1 || band.tp_atr.len() == 3,
                "band {n}: take-profit plan must have 1 or 3 rungs"
            );
            anyhow::ensure!(
                band.tp_atr.iter().all(|m| *m > Decimal::ZERO),
                "band {n}: take-profit multiples must be positive"
            );
            anyhow::ensure!(
                band.tp_atr.windows(2).all(|w| w[0] < w[1]),
                "band {n}: take-profit multiples must be strictly increasing"
            );
        }

        if self.bands.iter().any(|b| b.tp_atr.len() == 3) {
            anyhow::ensure!(
                self.ladder_fractions.len() == 3,
                "ladder_fractions must have 3 entries"
            );
            anyhow::ensure!(
                self.ladder_fractions.iter().all(|f| *f > Decimal::ZERO),
                "ladder fractions must be positive"
            );
            let sum: Decimal = self.ladder_fractions.iter().sum();
            anyhow::ensure!(sum <= Decimal::ONE, "ladder fractions sum to {sum} > 1");
        }

        anyhow::ensure!(
            self.sl_atr_multiplier > Decimal::ZERO,
            "sl_atr_multiplier must be positive"
        );
        anyhow::ensure!(
            self.max_funding_rate_pct >= Decimal::ZERO,
            "max_funding_rate_pct must not be negative"
        );
        anyhow::ensure!(
            self.hysteresis_factor > Decimal::ZERO && self.hysteresis_factor <= Decimal::ONE,
            "hysteresis_factor must be between 0 and 1"
        );

        Ok(())
    }
}

impl ExecutionConfig {
    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }

    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }
}

impl Default for BandingConfig {
    fn default() -> Self {
        Self {
            bands: default_bands(),
            ladder_fractions: default_ladder_fractions(),
            sl_atr_multiplier: default_sl_atr_multiplier(),
            max_funding_rate_pct: default_max_funding_rate_pct(),
            hysteresis_factor: default_hysteresis_factor(),
        }
    }
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            max_positions: default_max_positions(),
            capital_utilization: default_capital_utilization(),
            min_notional: default_min_notional(),
            quote_asset: default_quote_asset(),
            signal_workers: default_signal_workers(),
            execution_workers: default_execution_workers(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            margin_type: default_margin_type(),
            entry_offset_atr: default_entry_offset_atr(),
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
            fill_timeout_ms: default_fill_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_min_ms: default_retry_backoff_min_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            candle_hours: default_candle_hours(),
            window_tolerance_minutes: default_window_tolerance_minutes(),
            post_close_buffer_secs: default_post_close_buffer_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            error_cooldown_secs: default_error_cooldown_secs(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            breakeven_buffer_atr: default_breakeven_buffer_atr(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            base_url: default_signal_url(),
            timeout_secs: default_signal_timeout_secs(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_thresholds() {
        let banding = BandingConfig::default();
        assert_eq!(banding.max_funding_rate(), dec!(0.0004));
        assert_eq!(banding.weak_threshold(), dec!(0.15));
    }

    #[test]
    fn test_rejects_band_gap() {
        let mut banding = BandingConfig::default();
        banding.bands[1].lower = dec!(0.45);
        assert!(banding.validate().is_err());
    }

    #[test]
    fn test_rejects_overlap_and_inverted_bounds() {
        let mut banding = BandingConfig::default();
        banding.bands[0].upper = Some(dec!(0.5));
        assert!(banding.validate().is_err());

        let mut banding = BandingConfig::default();
        banding.bands[0].upper = Some(dec!(0.2));
        banding.bands[1].lower = dec!(0.2);
        assert!(banding.validate().is_err());
    }

    #[test]
    fn test_rejects_bounded_last_band() {
        let mut banding = BandingConfig::default();
        banding.bands[3].upper = Some(dec!(5));
        assert!(banding.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_ladders() {
        let mut banding = BandingConfig::default();
        banding.bands[2].tp_atr = vec![dec!(0.6), dec!(1.2)];
        assert!(banding.validate().is_err());

        let mut banding = BandingConfig::default();
        banding.bands[3].tp_atr = vec![dec!(0.8), dec!(0.8), dec!(3.0)];
        assert!(banding.validate().is_err());

        let mut banding = BandingConfig::default();
        banding.ladder_fractions = vec![dec!(0.5), dec!(0.4), dec!(0.2)];
        assert!(banding.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_leverage() {
        let mut banding = BandingConfig::default();
        banding.bands[0].leverage = 0;
        assert!(banding.validate().is_err());
    }

    #[test]
    fn test_scheduler_candle_must_divide_day() {
        let mut config = Config::default();
        config.scheduler.candle_hours = 5;
        assert!(config.validate().is_err());
    }
}
