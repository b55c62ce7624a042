/// frames.rs – Wire codec for the push-update feed.
///
/// Outbound frames are serialised as `{"type": ..., ...}` JSON text.  Inbound
/// frames arrive as `{type, channel?, data, timestamp}` and are validated
/// into a typed `Update` before anything is dispatched.
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    BacktestEvent, MarketQuote, ModuleEvent, PortfolioSnapshot, ServerNotice, StrategyEvent,
    TradeEvent,
};

pub const PORTFOLIO_CHANNEL: &str = "portfolio";
pub const TRADES_CHANNEL: &str = "trades";
pub const STRATEGIES_CHANNEL: &str = "strategies";
pub const BACKTESTS_CHANNEL: &str = "backtests";
pub const MODULES_CHANNEL: &str = "modules";

/// Channel name used for a symbol's market data, e.g. `market:AAPL`.
pub fn market_channel(symbol: &str) -> String {
    format!("market:{}", symbol.trim().to_uppercase())
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Auth {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Ping,
}

impl OutboundFrame {
    pub fn subscribe(channel: impl Into<String>) -> Self {
        OutboundFrame::Subscribe {
            channel: channel.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        OutboundFrame::Unsubscribe {
            channel: channel.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    MarketData,
    PortfolioUpdate,
    TradeUpdate,
    StrategyUpdate,
    BacktestUpdate,
    ModuleUpdate,
    Connection,
    Auth,
    Subscription,
    Error,
}

impl FrameKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "market_data" => FrameKind::MarketData,
            "portfolio_update" => FrameKind::PortfolioUpdate,
            "trade_update" => FrameKind::TradeUpdate,
            "strategy_update" => FrameKind::StrategyUpdate,
            "backtest_update" => FrameKind::BacktestUpdate,
            "module_update" => FrameKind::ModuleUpdate,
            "connection" => FrameKind::Connection,
            "auth" => FrameKind::Auth,
            "subscription" => FrameKind::Subscription,
            "error" => FrameKind::Error,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::MarketData => "market_data",
            FrameKind::PortfolioUpdate => "portfolio_update",
            FrameKind::TradeUpdate => "trade_update",
            FrameKind::StrategyUpdate => "strategy_update",
            FrameKind::BacktestUpdate => "backtest_update",
            FrameKind::ModuleUpdate => "module_update",
            FrameKind::Connection => "connection",
            FrameKind::Auth => "auth",
            FrameKind::Subscription => "subscription",
            FrameKind::Error => "error",
        }
    }

    /// Hard-wired destination for update kinds that do not carry their own channel.
    pub fn fixed_channel(self) -> Option<&'static str> {
        match self {
            FrameKind::PortfolioUpdate => Some(PORTFOLIO_CHANNEL),
            FrameKind::TradeUpdate => Some(TRADES_CHANNEL),
            FrameKind::StrategyUpdate => Some(STRATEGIES_CHANNEL),
            FrameKind::BacktestUpdate => Some(BACKTESTS_CHANNEL),
            FrameKind::ModuleUpdate => Some(MODULES_CHANNEL),
            _ => None,
        }
    }

    /// Protocol notices are logged, never routed to channel handlers.
    pub fn is_notice(self) -> bool {
        matches!(
            self,
            FrameKind::Connection | FrameKind::Auth | FrameKind::Subscription | FrameKind::Error
        )
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    MarketData(MarketQuote),
    Portfolio(PortfolioSnapshot),
    Trade(TradeEvent),
    Strategy(StrategyEvent),
    Backtest(BacktestEvent),
    Module(ModuleEvent),
    Connection(ServerNotice),
    Auth(ServerNotice),
    Subscription(ServerNotice),
    Error(ServerNotice),
}

impl Update {
    pub fn kind(&self) -> FrameKind {
        match self {
            Update::MarketData(_) => FrameKind::MarketData,
            Update::Portfolio(_) => FrameKind::PortfolioUpdate,
            Update::Trade(_) => FrameKind::TradeUpdate,
            Update::Strategy(_) => FrameKind::StrategyUpdate,
            Update::Backtest(_) => FrameKind::BacktestUpdate,
            Update::Module(_) => FrameKind::ModuleUpdate,
            Update::Connection(_) => FrameKind::Connection,
            Update::Auth(_) => FrameKind::Auth,
            Update::Subscription(_) => FrameKind::Subscription,
            Update::Error(_) => FrameKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Channel as sent by the server; only meaningful for `market_data`.
    pub channel: Option<String>,
    pub update: Update,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundFrame {
    pub fn kind(&self) -> FrameKind {
        self.update.kind()
    }

    /// Channel whose handler should receive this frame, if any.
    pub fn route(&self) -> Option<&str> {
        let kind = self.kind();
        match kind {
            FrameKind::MarketData => self.channel.as_deref(),
            _ => kind.fixed_channel(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: FrameKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("market_data frame without a channel")]
    MissingChannel,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Value,
}

/// Parse and validate one inbound text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let kind = FrameKind::parse(&raw.kind).ok_or_else(|| FrameError::UnknownType(raw.kind.clone()))?;

    let channel = raw.channel.filter(|c| !c.trim().is_empty());
    if kind == FrameKind::MarketData && channel.is_none() {
        return Err(FrameError::MissingChannel);
    }

    let data = match raw.data {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    let update = decode_update(kind, data)?;

    Ok(InboundFrame {
        channel,
        update,
        timestamp: parse_timestamp(&raw.timestamp),
    })
}

fn decode_update(kind: FrameKind, data: Value) -> Result<Update, FrameError> {
    fn payload<T: serde::de::DeserializeOwned>(
        kind: FrameKind,
        data: Value,
    ) -> Result<T, FrameError> {
        serde_json::from_value(data).map_err(|source| FrameError::Payload { kind, source })
    }

    Ok(match kind {
        FrameKind::MarketData => Update::MarketData(payload(kind, data)?),
        FrameKind::PortfolioUpdate => Update::Portfolio(payload(kind, data)?),
        FrameKind::TradeUpdate => Update::Trade(payload(kind, data)?),
        FrameKind::StrategyUpdate => Update::Strategy(payload(kind, data)?),
        FrameKind::BacktestUpdate => Update::Backtest(payload(kind, data)?),
        FrameKind::ModuleUpdate => Update::Module(payload(kind, data)?),
        FrameKind::Connection => Update::Connection(payload(kind, data)?),
        FrameKind::Auth => Update::Auth(payload(kind, data)?),
        FrameKind::Subscription => Update::Subscription(payload(kind, data)?),
        FrameKind::Error => Update::Error(payload(kind, data)?),
    })
}

/// RFC 3339 string or epoch milliseconds.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_frames_match_wire_shape() {
        let sub = OutboundFrame::subscribe("portfolio").to_json().unwrap();
        assert_eq!(sub, r#"{"type":"subscribe","channel":"portfolio"}"#);
        let auth = OutboundFrame::Auth {
            user_id: "u-1".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(auth, r#"{"type":"auth","userId":"u-1"}"#);
        assert_eq!(OutboundFrame::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn market_channel_normalises_symbol() {
        assert_eq!(market_channel(" aapl "), "market:AAPL");
    }

    #[test]
    fn timestamp_accepts_rfc3339_and_millis() {
        let a = parse_timestamp(&Value::String("2024-03-01T12:00:00Z".into())).unwrap();
        let b = parse_timestamp(&serde_json::json!(1_709_294_400_000i64)).unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp(&Value::String("yesterday".into())).is_none());
        assert!(parse_timestamp(&Value::Null).is_none());
    }

    #[test]
    fn null_data_decodes_to_defaults() {
        let frame = parse_frame(r#"{"type":"connection","data":null}"#).unwrap();
        assert_eq!(frame.update, Update::Connection(ServerNotice::default()));
        assert!(frame.route().is_none());
    }

    #[test]
    fn every_kind_round_trips_its_name() {
        for kind in [
            FrameKind::MarketData,
            FrameKind::PortfolioUpdate,
            FrameKind::TradeUpdate,
            FrameKind::StrategyUpdate,
            FrameKind::BacktestUpdate,
            FrameKind::ModuleUpdate,
            FrameKind::Connection,
            FrameKind::Auth,
            FrameKind::Subscription,
            FrameKind::Error,
        ] {
            assert_eq!(FrameKind::parse(kind.as_str()), Some(kind));
        }
    }
}
