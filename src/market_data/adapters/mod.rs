// Venue seams: where snapshots come from.

use async_trait::async_trait;

use crate::engine::types::OrderBookSnapshot;
use crate::error::SyncResult;

/// Point-in-time depth snapshot provider.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Failures are reported as `SyncError::Upstream`.
    async fn fetch_snapshot(&self, symbol: &str) -> SyncResult<OrderBookSnapshot>;
}

pub mod binance;
pub mod binance_types;

pub use binance::BinanceRest;
