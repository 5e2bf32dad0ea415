use tracing::{instrument, trace};

use crate::engine::types::{BookSide, DiffEvent, OrderBookSnapshot, PriceLevel, Side};

/// Locally maintained depth for one symbol.
///
/// Only the reconciler mutates it. A book is seeded once from a snapshot and
/// then moves forward diff by diff; `last_applied_id` never decreases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBook {
    pub bids: BookSide,
    pub asks: BookSide,
    last_applied_id: u64,
}

impl LocalBook {
    pub fn empty() -> Self {
        Self {
            bids: BookSide::new(Side::Bid),
            asks: BookSide::new(Side::Ask),
            last_applied_id: 0,
        }
    }

    #[instrument(level = "trace", skip(snapshot), fields(last_update_id = snapshot.last_update_id))]
    pub fn from_snapshot(snapshot: &OrderBookSnapshot) -> Self {
        let mut book = Self::empty();
        // zero-size rows in a snapshot are deletions of nothing
        for level in &snapshot.bids {
            book.bids.apply(*level);
        }
        for level in &snapshot.asks {
            book.asks.apply(*level);
        }
        book.last_applied_id = snapshot.last_update_id;
        trace!(bids = book.bids.len(), asks = book.asks.len(), "seeded book from snapshot");
        book
    }

    pub fn last_applied_id(&self) -> u64 {
        self.last_applied_id
    }

    /// Apply every delta of `diff` and advance to its final id.
    ///
    /// Sequencing is the caller's job; see [`Reconciler`](crate::engine::reconcile::Reconciler).
    pub(crate) fn apply_diff(&mut self, diff: &DiffEvent) {
        for level in &diff.bids {
            self.bids.apply(*level);
        }
        for level in &diff.asks {
            self.asks.apply(*level);
        }
        self.last_applied_id = self.last_applied_id.max(diff.final_update_id);
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.best()
    }

    /// Best ask minus best bid, in ticks.
    pub fn spread(&self) -> Option<i64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some(ask.price - bid.price)
    }

    /// Mid price in ticks (rounded down). Falls back to the only populated side.
    pub fn mid(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(b.price + (a.price - b.price) / 2),
            (Some(b), None) => Some(b.price),
            (None, Some(a)) => Some(a.price),
            (None, None) => None,
        }
    }

    pub fn is_crossed(&self) -> bool {
        matches!(self.spread(), Some(s) if s <= 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> OrderBookSnapshot {
        OrderBookSnapshot {
            bids: vec![PriceLevel::new(100, 5), PriceLevel::new(99, 3), PriceLevel::new(98, 0)],
            asks: vec![PriceLevel::new(102, 4), PriceLevel::new(103, 6)],
            last_update_id: 42,
        }
    }

    #[test]
    fn test_seed_from_snapshot() {
        let book = LocalBook::from_snapshot(&snapshot());
        assert_eq!(book.last_applied_id(), 42);
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.best_bid(), Some(PriceLevel::new(100, 5)));
        assert_eq!(book.best_ask(), Some(PriceLevel::new(102, 4)));
        assert_eq!(book.spread(), Some(2));
        assert_eq!(book.mid(), Some(101));
        assert!(!book.is_crossed());
    }

    #[test]
    fn test_apply_diff_upserts_and_deletes() {
        let mut book = LocalBook::from_snapshot(&snapshot());
        book.apply_diff(&DiffEvent {
            first_update_id: 43,
            final_update_id: 45,
            prev_final_update_id: None,
            bids: vec![PriceLevel::new(100, 0), PriceLevel::new(101, 2)],
            asks: vec![PriceLevel::new(103, 1)],
            event_time: None,
        });
        assert_eq!(book.last_applied_id(), 45);
        assert_eq!(book.bids.get(100), None);
        assert_eq!(book.best_bid(), Some(PriceLevel::new(101, 2)));
        assert_eq!(book.asks.get(103), Some(1));
    }

    #[test]
    fn test_empty_book() {
        let book = LocalBook::empty();
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.spread(), None);
        assert_eq!(book.mid(), None);
        assert_eq!(book.last_applied_id(), 0);
    }
}
