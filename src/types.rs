// =============================================================================
// Shared types used across the cycle bot
// =============================================================================

use serde::{Deserialize, Deserializer, Serialize};

/// Order side as Binance spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order status as reported by the REST API and the user data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    /// Anything the bot does not act on (e.g. `EXPIRED_IN_MATCH`).
    #[serde(other)]
    Other,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Other => write!(f, "OTHER"),
        }
    }
}

/// Time-in-force values the bot sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    /// Good till cancelled.
    Gtc,
    /// Good till crossing: post-only, rejected if it would take liquidity.
    Gtx,
}

impl TimeInForce {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gtc => "GTC",
            Self::Gtx => "GTX",
        }
    }
}

/// How the limit price of an order is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceSpec {
    /// Explicit limit price.
    Fixed(f64),
    /// `priceMatch=QUEUE`: the exchange prices the order at the first level
    /// of our own side of the book, so it always rests.
    Queue,
}

/// A LIMIT order as the bot submits it.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: PriceSpec,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

/// Order payload returned by place, cancel and open-orders endpoints.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: u64,
    #[serde(default)]
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    #[serde(default, deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub avg_price: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub orig_qty: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub executed_qty: f64,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Wallet and position figures for the traded instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountSnapshot {
    pub total_wallet_balance: f64,
    pub total_unrealized_profit: f64,
    pub position_amt: f64,
    pub entry_price: f64,
}

/// Binance encodes decimals as JSON strings; accept both strings and numbers.
pub fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(f64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Str(s) if s.is_empty() => Ok(0.0),
        Raw::Str(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
        Raw::Num(n) => Ok(n),
    }
}
