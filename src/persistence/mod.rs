//! SQLite order ledger.
//!
//! Local record of what the engine asked the exchange to do:
//! - Order records (insert-or-update by exchange order id)
//! - Bracket records (planned take-profit count and ATR per symbol)
//! - Wallet balance history
//!
//! The ledger is never the source of truth for positions; it feeds status
//! sync and the breakeven monitor.

use crate::exchange::{Order, OrderSide, OrderStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// One order as recorded locally.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub order_id: i64,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub leverage: u8,
    pub status: String,
    pub client_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Bracket placed for an entry; read back by the breakeven monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketRecord {
    pub symbol: String,
    pub entry_order_id: i64,
    pub side: OrderSide,
    pub entry_price: Decimal,
    pub atr: Decimal,
    pub planned_tp_legs: u32,
    pub created_at: DateTime<Utc>,
}

/// Wallet balance snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRecord {
    pub asset: String,
    pub wallet_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Append/query interface over the local ledger.
pub trait LedgerStore: Send + Sync {
    /// Insert or update an order record with the leverage it was placed under.
    fn log_order(&self, order: &Order, leverage: u8) -> Result<()>;

    fn update_status(&self, order_id: i64, status: OrderStatus) -> Result<()>;

    /// `(order_id, symbol)` of every record still NEW or PARTIALLY_FILLED.
    fn get_locally_open(&self) -> Result<Vec<(i64, String)>>;

    fn log_balance(&self, asset: &str, balance: Decimal, unrealized_pnl: Decimal) -> Result<()>;

    /// Upsert the bracket record for `record.symbol`.
    fn record_bracket(&self, record: &BracketRecord) -> Result<()>;

    fn get_bracket(&self, symbol: &str) -> Result<Option<BracketRecord>>;

    fn brackets(&self) -> Result<Vec<BracketRecord>>;

    fn recent_orders(&self, limit: usize) -> Result<Vec<OrderRecord>>;

    fn recent_balances(&self, limit: usize) -> Result<Vec<BalanceRecord>>;
}

/// SQLite-backed ledger; all access goes through one connection lock.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

fn parse_decimal(raw: String) -> Decimal {
    Decimal::from_str(&raw).unwrap_or_default()
}

fn parse_time(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Price worth recording: the fill average when known, else limit, else stop.
fn record_price(order: &Order) -> Decimal {
    [order.avg_price, order.price, order.stop_price]
        .into_iter()
        .find(|p| *p > Decimal::ZERO)
        .unwrap_or(Decimal::ZERO)
}

impl SqliteLedger {
    /// Open (or create) the ledger at `db_path`; `":memory:"` for tests.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && path.to_str() != Some(":memory:") {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create ledger directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;

        info!("Order ledger initialized at {:?}", path);
        Ok(ledger)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("ledger connection lock poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                status TEXT NOT NULL,
                client_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol);

            CREATE TABLE IF NOT EXISTS brackets (
                symbol TEXT PRIMARY KEY,
                entry_order_id INTEGER NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                atr TEXT NOT NULL,
                planned_tp_legs INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS balance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset TEXT NOT NULL,
                wallet_balance TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_balance_timestamp ON balance_history(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn order_from_row(row: &Row<'_>) -> rusqlite::Result<OrderRecord> {
        Ok(OrderRecord {
            order_id: row.get(0)?,
            symbol: row.get(1)?,
            side: row.get(2)?,
            order_type: row.get(3)?,
            quantity: parse_decimal(row.get(4)?),
            price: parse_decimal(row.get(5)?),
            leverage: row.get(6)?,
            status: row.get(7)?,
            client_id: row.get(8)?,
            updated_at: parse_time(row.get(9)?),
        })
    }

    fn bracket_from_row(row: &Row<'_>) -> rusqlite::Result<BracketRecord> {
        let side: String = row.get(2)?;
        Ok(BracketRecord {
            symbol: row.get(0)?,
            entry_order_id: row.get(1)?,
            side: if side == "SELL" {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            entry_price: parse_decimal(row.get(3)?),
            atr: parse_decimal(row.get(4)?),
            planned_tp_legs: row.get(5)?,
            created_at: parse_time(row.get(6)?),
        })
    }
}

impl LedgerStore for SqliteLedger {
    fn log_order(&self, order: &Order, leverage: u8) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO orders (order_id, symbol, side, order_type, quantity, price,
                                    leverage, status, client_id, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(order_id) DO UPDATE SET
                    quantity = ?5,
                    price = ?6,
                    leverage = ?7,
                    status = ?8,
                    updated_at = ?10
                "#,
                params![
                    order.order_id,
                    order.symbol,
                    order.side.as_str(),
                    order.order_type.as_str(),
                    order.orig_qty.to_string(),
                    record_price(order).to_string(),
                    leverage,
                    order.status.as_str(),
                    order.client_order_id,
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to log order {}", order.order_id))?;

        debug!(
            symbol = %order.symbol,
            order_id = order.order_id,
            status = %order.status,
            leverage,
            "Order logged"
        );
        Ok(())
    }

    fn update_status(&self, order_id: i64, status: OrderStatus) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE orders SET status = ?1, updated_at = ?2 WHERE order_id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), order_id],
        )?;

        debug!(order_id, %status, updated, "Order status updated");
        Ok(())
    }

    fn get_locally_open(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT order_id, symbol FROM orders
             WHERE status IN ('NEW', 'PARTIALLY_FILLED')
             ORDER BY order_id",
        )?;

        let open = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(open)
    }

    fn log_balance(&self, asset: &str, balance: Decimal, unrealized_pnl: Decimal) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO balance_history (asset, wallet_balance, unrealized_pnl, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                asset,
                balance.to_string(),
                unrealized_pnl.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;

        debug!(%asset, %balance, %unrealized_pnl, "Balance logged");
        Ok(())
    }

    fn record_bracket(&self, record: &BracketRecord) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO brackets (symbol, entry_order_id, side, entry_price, atr,
                                      planned_tp_legs, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(symbol) DO UPDATE SET
                    entry_order_id = ?2,
                    side = ?3,
                    entry_price = ?4,
                    atr = ?5,
                    planned_tp_legs = ?6,
                    created_at = ?7
                "#,
                params![
                    record.symbol,
                    record.entry_order_id,
                    record.side.as_str(),
                    record.entry_price.to_string(),
                    record.atr.to_string(),
                    record.planned_tp_legs,
                    record.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to record bracket for {}", record.symbol))?;
        Ok(())
    }

    fn get_bracket(&self, symbol: &str) -> Result<Option<BracketRecord>> {
        let record = self
            .conn()?
            .query_row(
                "SELECT symbol, entry_order_id, side, entry_price, atr, planned_tp_legs, created_at
                 FROM brackets WHERE symbol = ?1",
                [symbol],
                Self::bracket_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn brackets(&self) -> Result<Vec<BracketRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, entry_order_id, side, entry_price, atr, planned_tp_legs, created_at
             FROM brackets ORDER BY symbol",
        )?;
        let records = stmt
            .query_map([], Self::bracket_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn recent_orders(&self, limit: usize) -> Result<Vec<OrderRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT order_id, symbol, side, order_type, quantity, price, leverage, status,
                    client_id, updated_at
             FROM orders ORDER BY updated_at DESC, order_id DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit as i64], Self::order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn recent_balances(&self, limit: usize) -> Result<Vec<BalanceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT asset, wallet_balance, unrealized_pnl, timestamp
             FROM balance_history ORDER BY id DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit as i64], |row| {
                Ok(BalanceRecord {
                    asset: row.get(0)?,
                    wallet_balance: parse_decimal(row.get(1)?),
                    unrealized_pnl: parse_decimal(row.get(2)?),
                    timestamp: parse_time(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
