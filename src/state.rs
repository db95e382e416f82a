// =============================================================================
// Close Book — resting close orders and realized PnL
// =============================================================================
//
// The control loop replaces the active set wholesale after every reconciling
// query; the listener prunes ids as close orders fill and adds to the
// cumulative PnL. Both sides go through the same mutexes.
// =============================================================================

use parking_lot::Mutex;

/// Shared close-order bookkeeping.
#[derive(Debug, Default)]
pub struct CloseBook {
    active: Mutex<Vec<u64>>,
    realized_pnl: Mutex<f64>,
}

impl CloseBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active set with the exchange's view.
    pub fn replace(&self, ids: Vec<u64>) {
        *self.active.lock() = ids;
    }

    pub fn ids(&self) -> Vec<u64> {
        self.active.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    /// Book a filled close order: drop it from the active set and add
    /// `offset × quantity` to the running PnL. Returns the new total.
    ///
    /// This is the fixed-offset approximation: fees and any slippage of the
    /// queue-priced fallback are not accounted for.
    pub fn record_close_fill(&self, order_id: u64, quantity: f64, offset: f64) -> f64 {
        self.active.lock().retain(|id| *id != order_id);
        let mut pnl = self.realized_pnl.lock();
        *pnl += offset * quantity;
        *pnl
    }

    pub fn cumulative_pnl(&self) -> f64 {
        *self.realized_pnl.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_fill_adds_offset_times_quantity() {
        let book = CloseBook::new();
        book.replace(vec![11, 12]);
        let total = book.record_close_fill(11, 0.01, 1.0);
        assert!((total - 0.01).abs() < 1e-12);
        assert_eq!(book.ids(), vec![12]);

        let total = book.record_close_fill(12, 0.02, 1.0);
        assert!((total - 0.03).abs() < 1e-12);
        assert_eq!(book.len(), 0);
    }

    #[test]
    fn unknown_close_id_still_counts_pnl() {
        let book = CloseBook::new();
        book.replace(vec![1]);
        book.record_close_fill(42, 0.5, 2.0);
        assert_eq!(book.ids(), vec![1]);
        assert!((book.cumulative_pnl() - 1.0).abs() < 1e-12);
    }
}
