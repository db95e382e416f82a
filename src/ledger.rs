// =============================================================================
// Transaction Log — append-only CSV record of every completed leg
// =============================================================================
//
// Row layout:
//   timestamp, instrument, order_id, leg_type, counter_order_id, price, quantity, status
//
// The bot never reads this file back. A failed write is logged and swallowed
// so that bookkeeping trouble cannot stall trading.
// =============================================================================

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use parking_lot::Mutex;
use tracing::{debug, error};

/// Which half of the cycle a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Open,
    Close,
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// One completed leg.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub order_id: u64,
    pub leg: Leg,
    pub counter_order_id: Option<u64>,
    pub price: f64,
    pub quantity: f64,
    pub status: String,
}

impl TransactionRecord {
    fn to_row(&self) -> [String; 8] {
        [
            self.timestamp.to_rfc3339(),
            self.symbol.clone(),
            self.order_id.to_string(),
            self.leg.to_string(),
            self.counter_order_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            format!("{:.6}", self.price),
            format!("{:.6}", self.quantity),
            self.status.clone(),
        ]
    }
}

/// Append-only CSV sink, one file per instrument.
#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TransactionLog {
    /// `<dir>/<SYMBOL>_transactions_log.csv`
    pub fn new(dir: &Path, symbol: &str) -> Self {
        Self {
            path: dir.join(format!("{symbol}_transactions_log.csv")),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `record`; failures are logged, never returned.
    pub fn append(&self, record: &TransactionRecord) {
        match self.try_append(record) {
            Ok(()) => debug!(
                order_id = record.order_id,
                leg = %record.leg,
                status = %record.status,
                "transaction recorded"
            ),
            Err(e) => error!(
                error = ?e,
                order_id = record.order_id,
                leg = %record.leg,
                "failed to record transaction"
            ),
        }
    }

    fn try_append(&self, record: &TransactionRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .write_record(record.to_row())
            .context("failed to write transaction row")?;
        writer.flush().context("failed to flush transaction log")?;
        Ok(())
    }
}
