// Convert wire decimal strings into integer ticks/lots and back.
// Scales come from venue config; excess precision is an error, never truncated.

use crate::config::VenueConfig;
use crate::engine::types::PriceLevel;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normaliser {
    price_decimals: u32,
    size_decimals: u32,
}

impl Normaliser {
    pub fn new(price_decimals: u32, size_decimals: u32) -> Self {
        Self { price_decimals, size_decimals }
    }

    pub fn from_venue(venue: &VenueConfig) -> Self {
        Self::new(venue.price_decimals, venue.size_decimals)
    }

    pub fn price_decimals(&self) -> u32 {
        self.price_decimals
    }

    pub fn price_to_ticks(&self, s: &str) -> SyncResult<i64> {
        let v = parse_fixed(s, self.price_decimals)?;
        i64::try_from(v).map_err(|_| SyncError::Protocol(format!("price {s:?} out of range")))
    }

    pub fn size_to_lots(&self, s: &str) -> SyncResult<u64> {
        let v = parse_fixed(s, self.size_decimals)?;
        u64::try_from(v).map_err(|_| SyncError::Protocol(format!("size {s:?} out of range")))
    }

    /// One `[price, size]` wire pair.
    pub fn level(&self, price: &str, size: &str) -> SyncResult<PriceLevel> {
        Ok(PriceLevel::new(self.price_to_ticks(price)?, self.size_to_lots(size)?))
    }

    pub fn levels(&self, raw: &[[String; 2]]) -> SyncResult<Vec<PriceLevel>> {
        raw.iter().map(|[p, q]| self.level(p, q)).collect()
    }

    pub fn format_price(&self, ticks: i64) -> String {
        let sign = if ticks < 0 { "-" } else { "" };
        format!("{sign}{}", format_fixed(ticks.unsigned_abs(), self.price_decimals))
    }

    pub fn format_size(&self, lots: u64) -> String {
        format_fixed(lots, self.size_decimals)
    }
}

fn parse_fixed(s: &str, decimals: u32) -> SyncResult<u128> {
    let bad = || SyncError::Protocol(format!("invalid decimal {s:?}"));
    let (int_part, frac_part) = s.split_once('.').unwrap_or((s, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(bad());
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }

    let scale = decimals as usize;
    let (kept, excess) = frac_part.split_at(frac_part.len().min(scale));
    if excess.bytes().any(|b| b != b'0') {
        return Err(SyncError::Protocol(format!(
            "{s:?} has more than {decimals} significant decimals"
        )));
    }

    let int: u128 = if int_part.is_empty() { 0 } else { int_part.parse().map_err(|_| bad())? };
    let frac: u128 = if kept.is_empty() { 0 } else { kept.parse().map_err(|_| bad())? };
    let pad = 10u128.pow((scale - kept.len()) as u32);
    int.checked_mul(10u128.pow(decimals))
        .and_then(|v| v.checked_add(frac * pad))
        .ok_or_else(bad)
}

fn format_fixed(v: u64, decimals: u32) -> String {
    if decimals == 0 {
        return v.to_string();
    }
    let scale = 10u64.pow(decimals);
    let frac = format!("{:0width$}", v % scale, width = decimals as usize);
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        (v / scale).to_string()
    } else {
        format!("{}.{frac}", v / scale)
    }
}
