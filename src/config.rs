// =============================================================================
// Configuration — CLI flags with environment fallback
// =============================================================================
//
// Every flag can also be supplied through the environment (a `.env` file is
// loaded at startup). A flag given on the command line always wins over the
// environment. The resulting `TradingConfig` is immutable for the lifetime of
// the process.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::binance::Endpoints;
use crate::types::Side;

// =============================================================================
// CLI
// =============================================================================

/// Open/close cycle bot for Binance USDⓈ-M futures.
#[derive(Debug, Parser)]
#[command(name = "tp-cycle-bot", version, about)]
pub struct Cli {
    /// Trading pair symbol.
    #[arg(long, env = "BOT_SYMBOL", default_value = "ETHUSDC")]
    pub symbol: String,

    /// Quantity of every open order.
    #[arg(long, env = "BOT_QUANTITY", default_value_t = 0.01)]
    pub quantity: f64,

    /// Distance between the fill price and the close order, in quote units.
    #[arg(long, alias = "take-profit", env = "BOT_OFFSET", default_value_t = 1.0)]
    pub offset: f64,

    /// Direction of the position the bot builds.
    #[arg(long, value_enum, env = "BOT_DIRECTION", default_value_t = Direction::Long)]
    pub direction: Direction,

    /// Maximum number of close orders resting at the same time.
    #[arg(long, env = "BOT_MAX_ORDERS", default_value_t = 75)]
    pub max_orders: usize,

    /// Seconds between open orders once the close book is above a third full.
    #[arg(long, env = "BOT_WAIT_TIME", default_value_t = 30)]
    pub wait_time: u64,

    /// Directory for the activity log and the transaction log.
    #[arg(long, env = "BOT_LOG_DIR", default_value = ".")]
    pub log_dir: PathBuf,

    /// Mirror log lines to stdout.
    #[arg(long, env = "BOT_LOG_TO_CONSOLE")]
    pub log_to_console: bool,

    /// Trade against the futures testnet.
    #[arg(long, env = "BOT_TESTNET")]
    pub testnet: bool,

    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,
}

impl Cli {
    /// Build and validate the immutable trading configuration.
    pub fn trading_config(&self) -> Result<TradingConfig> {
        let config = TradingConfig {
            symbol: self.symbol.trim().to_uppercase(),
            quantity: self.quantity,
            offset: self.offset,
            direction: self.direction,
            max_orders: self.max_orders,
            wait_time: Duration::from_secs(self.wait_time),
        };
        config.validate()?;
        Ok(config)
    }

    /// API key pair; both halves are mandatory.
    pub fn credentials(&self) -> Result<Credentials> {
        match (non_empty(&self.api_key), non_empty(&self.api_secret)) {
            (Some(api_key), Some(api_secret)) => Ok(Credentials {
                api_key: api_key.to_string(),
                api_secret: api_secret.to_string(),
            }),
            _ => bail!("API_KEY and API_SECRET must be set (flag or environment)"),
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        if self.testnet {
            Endpoints::testnet()
        } else {
            Endpoints::mainnet()
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

// =============================================================================
// Direction
// =============================================================================

/// Which side of the market the bot accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
pub enum Direction {
    #[value(alias = "buy")]
    Long,
    #[value(alias = "sell")]
    Short,
}

impl Direction {
    pub fn open_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    pub fn close_side(self) -> Side {
        self.open_side().opposite()
    }

    /// Price of the profit-taking close order for a fill at `fill_price`.
    ///
    /// SHORT mirrors LONG: the buy-back sits `offset` below the sell fill, so
    /// every closed unit captures `offset` in either direction.
    pub fn close_price(self, fill_price: f64, offset: f64) -> f64 {
        match self {
            Self::Long => fill_price + offset,
            // Buying back above the fill would lock in a loss.
            Self::Short => fill_price - offset,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

// =============================================================================
// TradingConfig
// =============================================================================

/// Immutable trading parameters.
#[derive(Debug, Clone, Serialize)]
pub struct TradingConfig {
    pub symbol: String,
    pub quantity: f64,
    /// Profit captured per unit of quantity by every close order.
    pub offset: f64,
    pub direction: Direction,
    pub max_orders: usize,
    pub wait_time: Duration,
}

impl TradingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            bail!("symbol must not be empty");
        }
        if !(self.quantity.is_finite() && self.quantity > 0.0) {
            bail!("quantity must be positive, got {}", self.quantity);
        }
        if !(self.offset.is_finite() && self.offset > 0.0) {
            bail!("offset must be positive, got {}", self.offset);
        }
        if self.max_orders == 0 {
            bail!("max-orders must be at least 1");
        }
        Ok(())
    }

    pub fn open_side(&self) -> Side {
        self.direction.open_side()
    }

    pub fn close_side(&self) -> Side {
        self.direction.close_side()
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// API key pair. Never printed.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// LoopTimings
// =============================================================================

/// Fixed intervals of the control loop and its background tasks.
#[derive(Debug, Clone)]
pub struct LoopTimings {
    /// How long an open order may rest before it is cancelled.
    pub fill_timeout: Duration,
    /// Sleep while the close book is full.
    pub saturated_sleep: Duration,
    /// Upper bound on a single pacing sleep.
    pub pacing_cap: Duration,
    /// Minimum pause after a failed iteration.
    pub error_backoff: Duration,
    /// Listen-key renewal period (keys expire after 60 minutes).
    pub keepalive_interval: Duration,
    /// Period of the status log line.
    pub status_interval: Duration,
    /// Delay before the listener reconnects.
    pub reconnect_delay: Duration,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            fill_timeout: Duration::from_secs(10),
            saturated_sleep: Duration::from_secs(10),
            pacing_cap: Duration::from_secs(10),
            error_backoff: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(30 * 60),
            status_interval: Duration::from_secs(300),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["tp-cycle-bot"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn long_closes_with_sell_above_fill() {
        let dir = Direction::Long;
        assert_eq!(dir.open_side(), Side::Buy);
        assert_eq!(dir.close_side(), Side::Sell);
        assert!((dir.close_price(2000.0, 1.0) - 2001.0).abs() < f64::EPSILON);
    }

    #[test]
    fn short_closes_with_buy_below_fill() {
        let dir = Direction::Short;
        assert_eq!(dir.open_side(), Side::Sell);
        assert_eq!(dir.close_side(), Side::Buy);
        assert!((dir.close_price(2000.0, 1.0) - 1999.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flags_build_trading_config() {
        let cli = parse(&[
            "--symbol", "btcusdc", "--quantity", "0.002", "--take-profit", "25",
            "--direction", "sell", "--max-orders", "10", "--wait-time", "60",
        ]);
        let cfg = cli.trading_config().unwrap();
        assert_eq!(cfg.symbol, "BTCUSDC");
        assert!((cfg.quantity - 0.002).abs() < f64::EPSILON);
        assert!((cfg.offset - 25.0).abs() < f64::EPSILON);
        assert_eq!(cfg.direction, Direction::Short);
        assert_eq!(cfg.max_orders, 10);
        assert_eq!(cfg.wait_time, Duration::from_secs(60));
    }

    #[test]
    fn rejects_non_positive_values() {
        let cli = parse(&["--quantity", "0"]);
        assert!(cli.trading_config().is_err());
        let cli = parse(&["--max-orders", "0"]);
        assert!(cli.trading_config().is_err());
        let cli = parse(&["--offset=-1"]);
        assert!(cli.trading_config().is_err());
    }

    #[test]
    fn credentials_require_both_halves() {
        let cli = parse(&["--api-key", "k", "--api-secret", " "]);
        assert!(cli.credentials().is_err());
        let cli = parse(&["--api-key", "k", "--api-secret", "topsecret"]);
        let creds = cli.credentials().unwrap();
        assert_eq!(creds.api_key, "k");
        assert!(!format!("{creds:?}").contains("topsecret"));
    }
}
