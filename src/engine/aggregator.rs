//! Turns the tick-precision book into a bounded, human-scaled depth view.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::engine::book::LocalBook;
use crate::engine::types::{BookSide, Side};

/// (minimum mid price, bucket size), as powers of ten in whole price units.
/// Coarser buckets for higher-priced assets.
const GROUPING_STEPS: [(i32, i32); 5] = [(4, 1), (3, 0), (2, -1), (1, -2), (0, -3)];
const FINEST_BUCKET_EXP: i32 = -4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeveledEntry {
    /// Bucket price in ticks.
    pub price: i64,
    /// Summed size of raw levels in the bucket, in lots.
    pub size: u64,
    /// Running total from the best bucket down to this one.
    pub cumulative: u64,
    pub is_wall: bool,
}

/// Consumer-facing view of one book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepthView {
    pub symbol: String,
    pub bids: Vec<LeveledEntry>,
    pub asks: Vec<LeveledEntry>,
    /// Raw best ask minus best bid, in ticks.
    pub spread: Option<i64>,
    /// Bucket size in ticks.
    pub grouping: i64,
    pub last_update_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WallEvent {
    pub symbol: String,
    pub side: Side,
    pub price: i64,
    /// Share of visible side size, basis points.
    pub share_bps: u64,
}

#[derive(Debug, Clone)]
pub struct LevelAggregator {
    visible_depth: usize,
    wall_threshold_bps: u64,
    price_decimals: u32,
}

impl LevelAggregator {
    pub fn new(visible_depth: usize, wall_threshold_bps: u64, price_decimals: u32) -> Self {
        Self { visible_depth: visible_depth.max(1), wall_threshold_bps, price_decimals }
    }

    pub fn aggregate(&self, symbol: &str, book: &LocalBook) -> DepthView {
        let grouping = book.mid().map(|m| self.grouping_for(m)).unwrap_or(1);
        DepthView {
            symbol: symbol.to_string(),
            bids: self.level_side(&book.bids, grouping),
            asks: self.level_side(&book.asks, grouping),
            spread: book.spread(),
            grouping,
            last_update_id: book.last_applied_id(),
        }
    }

    /// Bucket size in ticks for a mid price in ticks; never finer than one tick.
    pub fn grouping_for(&self, mid_ticks: i64) -> i64 {
        let decimals = self.price_decimals as i32;
        let bucket_exp = GROUPING_STEPS
            .iter()
            .find(|(min_exp, _)| {
                pow10(min_exp + decimals).map_or(false, |threshold| mid_ticks >= threshold)
            })
            .map(|(_, bucket)| *bucket)
            .unwrap_or(FINEST_BUCKET_EXP);
        pow10(bucket_exp + decimals).unwrap_or(1).max(1)
    }

    fn level_side(&self, side: &BookSide, grouping: i64) -> Vec<LeveledEntry> {
        let mut buckets: BTreeMap<i64, u64> = BTreeMap::new();
        for level in side.iter_best() {
            let key = bucket_price(side.side(), level.price, grouping);
            let slot = buckets.entry(key).or_default();
            *slot = slot.saturating_add(level.size);
        }

        let ordered: Vec<(i64, u64)> = match side.side() {
            Side::Bid => buckets.into_iter().rev().take(self.visible_depth).collect(),
            Side::Ask => buckets.into_iter().take(self.visible_depth).collect(),
        };
        let total: u64 = ordered.iter().fold(0u64, |acc, (_, s)| acc.saturating_add(*s));

        let mut cumulative = 0u64;
        ordered
            .into_iter()
            .map(|(price, size)| {
                cumulative = cumulative.saturating_add(size);
                LeveledEntry {
                    price,
                    size,
                    cumulative,
                    is_wall: is_wall(size, total, self.wall_threshold_bps),
                }
            })
            .collect()
    }
}

/// Exclusive rule: a share exactly equal to the threshold is not a wall.
pub fn is_wall(size: u64, side_total: u64, threshold_bps: u64) -> bool {
    side_total > 0 && (size as u128) * 10_000 > (threshold_bps as u128) * (side_total as u128)
}

fn share_bps(size: u64, side_total: u64) -> u64 {
    if side_total == 0 {
        return 0;
    }
    ((size as u128) * 10_000 / side_total as u128) as u64
}

// Bids floor, asks ceil, so a bucket never straddles the spread.
fn bucket_price(side: Side, price: i64, grouping: i64) -> i64 {
    let floor = price.div_euclid(grouping) * grouping;
    match side {
        Side::Bid => floor,
        Side::Ask if floor == price => floor,
        Side::Ask => floor + grouping,
    }
}

fn pow10(exp: i32) -> Option<i64> {
    if exp < 0 {
        return None;
    }
    10i64.checked_pow(exp as u32)
}

/// Remembers which buckets were walls in the previous view, so a wall is
/// reported once when it appears rather than on every render.
#[derive(Debug, Default)]
pub struct WallTracker {
    active: HashSet<(Side, i64)>,
}

impl WallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, view: &DepthView) -> Vec<WallEvent> {
        let mut current = HashSet::new();
        let mut fresh = Vec::new();
        for (side, entries) in [(Side::Bid, &view.bids), (Side::Ask, &view.asks)] {
            let total = entries.last().map(|e| e.cumulative).unwrap_or(0);
            for entry in entries.iter().filter(|e| e.is_wall) {
                current.insert((side, entry.price));
                if !self.active.contains(&(side, entry.price)) {
                    fresh.push(WallEvent {
                        symbol: view.symbol.clone(),
                        side,
                        price: entry.price,
                        share_bps: share_bps(entry.size, total),
                    });
                }
            }
        }
        self.active = current;
        fresh
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}
