// Raw stream text -> typed DiffEvent for one symbol.

use serde_json::Value;
use tracing::trace;

use crate::engine::types::DiffEvent;
use crate::error::{SyncError, SyncResult};
use crate::market_data::adapters::binance_types::DepthUpdate;
use crate::market_data::normaliser::Normaliser;

const DEPTH_UPDATE: &str = "depthUpdate";

/// Parser for the diff stream of a single symbol.
///
/// Returns `Ok(None)` for traffic that is not a depth update for this symbol
/// (subscription acks, other event types, other symbols). A depth update
/// that cannot be decoded is a protocol error: its updates are lost.
#[derive(Debug, Clone)]
pub struct DiffStream {
    symbol: String,
    normaliser: Normaliser,
}

impl DiffStream {
    pub fn new(symbol: &str, normaliser: Normaliser) -> Self {
        Self { symbol: symbol.to_uppercase(), normaliser }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn parse(&self, text: &str) -> SyncResult<Option<DiffEvent>> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("unparseable stream frame: {e}")))?;

        // combined streams wrap the payload as {"stream": .., "data": {..}}
        if let Some(data) = value.get_mut("data").filter(|d| d.is_object()).map(Value::take) {
            value = data;
        }

        match value.get("e").and_then(Value::as_str) {
            Some(DEPTH_UPDATE) => {}
            other => {
                trace!(event = ?other, "ignoring non-depth message");
                return Ok(None);
            }
        }
        match value.get("s").and_then(Value::as_str) {
            Some(s) if s.eq_ignore_ascii_case(&self.symbol) => {}
            other => {
                trace!(symbol = ?other, expected = %self.symbol, "ignoring depth update for another symbol");
                return Ok(None);
            }
        }

        let raw: DepthUpdate = serde_json::from_value(value)
            .map_err(|e| SyncError::Protocol(format!("malformed depth update: {e}")))?;
        if raw.first_update_id > raw.final_update_id {
            return Err(SyncError::Protocol(format!(
                "depth update range inverted: U={} u={}",
                raw.first_update_id, raw.final_update_id
            )));
        }

        Ok(Some(DiffEvent {
            first_update_id: raw.first_update_id,
            final_update_id: raw.final_update_id,
            prev_final_update_id: raw.prev_final_update_id,
            bids: self.normaliser.levels(&raw.bids)?,
            asks: self.normaliser.levels(&raw.asks)?,
            event_time: Some(raw.event_time),
        }))
    }
}
