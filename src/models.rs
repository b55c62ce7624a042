/// models.rs – Data types carried by the push-update feed and the dashboard view model.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::frames::Update;

const MAX_RECENT_TRADES: usize = 50;
const MAX_LOG_LINES: usize = 200;

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle of the push-update connection, published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Reconnect attempts exhausted; nothing more happens until a manual reconnect.
    Offline {
        attempts: u32,
    },
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::ReconnectScheduled { .. } => "RECONNECTING",
            ConnectionState::Offline { .. } => "OFFLINE",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::ReconnectScheduled { attempt, delay } => write!(
                f,
                "RECONNECTING (attempt {attempt} in {:.1}s)",
                delay.as_secs_f64()
            ),
            ConnectionState::Offline { attempts } => {
                write!(f, "OFFLINE after {attempts} attempt(s)")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Feed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarketQuote {
    pub symbol: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

impl MarketQuote {
    pub fn spread(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
}

impl PositionSnapshot {
    /// Unrealized P&L as a fraction of cost basis.
    pub fn unrealized_pct(&self) -> Option<f64> {
        let cost = self.quantity * self.avg_price;
        if cost == 0.0 {
            return None;
        }
        Some(self.unrealized_pnl / cost.abs())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub buying_power: f64,
    pub day_pnl: f64,
    pub total_pnl: f64,
    pub positions: Vec<PositionSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TradeEvent {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub status: String,
    pub executed_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StrategyEvent {
    pub id: String,
    pub name: String,
    pub status: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BacktestEvent {
    pub id: String,
    pub strategy_id: String,
    pub status: String,
    /// 0.0 – 1.0
    pub progress: f64,
    pub total_return: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModuleEvent {
    pub id: String,
    pub title: String,
    /// 0.0 – 1.0
    pub progress: f64,
    pub completed: bool,
}

/// Body of `connection`, `auth`, `subscription` and `error` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerNotice {
    pub message: Option<String>,
    pub status: Option<String>,
    pub channel: Option<String>,
}

impl ServerNotice {
    pub fn summary(&self) -> String {
        match (&self.status, &self.message) {
            (Some(s), Some(m)) => format!("{s}: {m}"),
            (Some(s), None) => s.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => "-".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dashboard view model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct AppState {
    pub user_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub feed_url: String,
    pub connection: ConnectionState,
    pub portfolio: PortfolioSnapshot,
    /// symbol → latest quote
    pub quotes: BTreeMap<String, MarketQuote>,
    pub recent_trades: VecDeque<TradeEvent>,
    pub strategies: Vec<StrategyEvent>,
    pub backtests: Vec<BacktestEvent>,
    pub modules: Vec<ModuleEvent>,
    pub logs: VecDeque<String>,
    pub updates_received: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl AppState {
    pub fn add_log(&mut self, msg: impl Into<String>) {
        let entry = format!("[{}] {}", Utc::now().format("%H:%M:%S"), msg.into());
        self.logs.push_front(entry);
        while self.logs.len() > MAX_LOG_LINES {
            self.logs.pop_back();
        }
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        self.connection = state;
        self.add_log(format!("Feed {state}"));
    }

    /// Fold one inbound update into the view model.
    pub fn apply(&mut self, update: &Update) {
        self.updates_received += 1;
        self.last_update = Some(Utc::now());
        match update {
            Update::MarketData(q) => {
                self.quotes.insert(q.symbol.clone(), q.clone());
            }
            Update::Portfolio(p) => {
                self.portfolio = p.clone();
            }
            Update::Trade(t) => {
                self.add_log(format!(
                    "Trade {} {} {:.2} @ {:.2} ({})",
                    t.side, t.symbol, t.quantity, t.price, t.status
                ));
                self.recent_trades.retain(|existing| existing.id != t.id || t.id.is_empty());
                self.recent_trades.push_front(t.clone());
                while self.recent_trades.len() > MAX_RECENT_TRADES {
                    self.recent_trades.pop_back();
                }
            }
            Update::Strategy(s) => {
                if let Some(msg) = &s.message {
                    self.add_log(format!("Strategy {}: {msg}", s.name));
                }
                upsert_by_id(&mut self.strategies, s.clone(), |x| &x.id);
            }
            Update::Backtest(b) => {
                upsert_by_id(&mut self.backtests, b.clone(), |x| &x.id);
            }
            Update::Module(m) => {
                if m.completed {
                    self.add_log(format!("Module completed: {}", m.title));
                }
                upsert_by_id(&mut self.modules, m.clone(), |x| &x.id);
            }
            // Notices are logged by the feed client and never routed here.
            Update::Connection(_) | Update::Auth(_) | Update::Subscription(_) | Update::Error(_) => {}
        }
    }
}

fn upsert_by_id<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &String) {
    match items.iter().position(|x| id(x) == id(&item)) {
        Some(idx) => items[idx] = item,
        None => items.push(item),
    }
}
