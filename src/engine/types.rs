use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

/// One price level in fixed point: price in ticks, size in lots.
/// A size of zero is a deletion marker, never a resting level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: i64,
    pub size: u64,
}

impl PriceLevel {
    pub fn new(price: i64, size: u64) -> Self {
        Self { price, size }
    }

    pub fn is_delete(&self) -> bool {
        self.size == 0
    }
}

/// Point-in-time depth as returned by the snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_update_id: u64,
}

/// Incremental depth update covering update ids `[first_update_id, final_update_id]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEvent {
    pub first_update_id: u64,
    pub final_update_id: u64,
    /// `final_update_id` of the previous event on the stream, when the venue sends it.
    pub prev_final_update_id: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Venue event time in unix millis.
    pub event_time: Option<u64>,
}

/// Price -> size for one side of the book. Unique keys, zero sizes never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookSide {
    side: Side,
    levels: BTreeMap<i64, u64>,
}

impl BookSide {
    pub fn new(side: Side) -> Self {
        Self { side, levels: BTreeMap::new() }
    }

    /// Upsert, or remove the exact price key when `size == 0`.
    pub fn apply(&mut self, level: PriceLevel) {
        if level.is_delete() {
            self.levels.remove(&level.price);
        } else {
            self.levels.insert(level.price, level.size);
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn get(&self, price: i64) -> Option<u64> {
        self.levels.get(&price).copied()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Best level first: highest price for bids, lowest for asks.
    pub fn iter_best(&self) -> Box<dyn Iterator<Item = PriceLevel> + '_> {
        let it = self.levels.iter().map(|(p, s)| PriceLevel::new(*p, *s));
        match self.side {
            Side::Bid => Box::new(it.rev()),
            Side::Ask => Box::new(it),
        }
    }

    pub fn best(&self) -> Option<PriceLevel> {
        self.iter_best().next()
    }

    pub fn total_size(&self) -> u64 {
        self.levels.values().fold(0u64, |acc, s| acc.saturating_add(*s))
    }
}
