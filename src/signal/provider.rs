//! Signal provider trait and its implementations.

use crate::config::SignalConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

/// Model output for one symbol at the latest candle close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Signed expected-value score; sign gives direction.
    pub edge: Decimal,
    /// Recent return volatility, used for inverse-volatility weighting.
    pub volatility: Decimal,
    /// Average true range in price units.
    pub atr: Decimal,
}

/// Source of per-symbol signals. Failures are per symbol.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignalProvider: Send + Sync {
    async fn get_signal(&self, symbol: &str) -> Result<Signal>;
}

/// Fetches signals from a model service at `{base_url}/signal/{symbol}`.
pub struct HttpSignalProvider {
    http: Client,
    base_url: String,
}

impl HttpSignalProvider {
    pub fn new(config: &SignalConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SignalProvider for HttpSignalProvider {
    #[instrument(skip(self))]
    async fn get_signal(&self, symbol: &str) -> Result<Signal> {
        let url = format!("{}/signal/{}", self.base_url, symbol);
        let signal: Signal = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch signal for {symbol}"))?
            .error_for_status()
            .with_context(|| format!("Signal service refused {symbol}"))?
            .json()
            .await
            .with_context(|| format!("Failed to parse signal for {symbol}"))?;

        debug!(%symbol, edge = %signal.edge, volatility = %signal.volatility, atr = %signal.atr, "Signal received");
        Ok(signal)
    }
}

/// Fixed signals, loaded from a JSON map of symbol to signal.
#[derive(Debug, Clone, Default)]
pub struct StaticSignalProvider {
    signals: HashMap<String, Signal>,
}

impl StaticSignalProvider {
    pub fn new(signals: HashMap<String, Signal>) -> Self {
        Self { signals }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signals from {:?}", path))?;
        let signals: HashMap<String, Signal> =
            serde_json::from_str(&raw).context("Failed to parse signals file")?;
        Ok(Self::new(signals))
    }

    pub fn with_signal(mut self, symbol: &str, signal: Signal) -> Self {
        self.signals.insert(symbol.to_string(), signal);
        self
    }
}

#[async_trait]
impl SignalProvider for StaticSignalProvider {
    async fn get_signal(&self, symbol: &str) -> Result<Signal> {
        self.signals
            .get(symbol)
            .cloned()
            .with_context(|| format!("No signal configured for {symbol}"))
    }
}
