// Binance USD-M futures adapter: REST depth snapshot + stream URL.

use async_trait::async_trait;
use tracing::{debug, info};

use super::binance_types::{ApiError, DepthSnapshot};
use super::SnapshotSource;
use crate::config::{BookConfig, VenueConfig};
use crate::engine::types::OrderBookSnapshot;
use crate::error::{SyncError, SyncResult};
use crate::market_data::normaliser::Normaliser;

pub struct BinanceRest {
    client: reqwest::Client,
    depth_url: String,
    limit: u32,
    normaliser: Normaliser,
}

impl BinanceRest {
    pub fn new(venue: &VenueConfig, book: &BookConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(book.snapshot_timeout())
            .gzip(true)
            .build()
            .map_err(|e| SyncError::Upstream(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            depth_url: format!("{}{}", venue.rest_url.trim_end_matches('/'), venue.depth_path),
            limit: book.snapshot_limit,
            normaliser: Normaliser::from_venue(venue),
        })
    }
}

#[async_trait]
impl SnapshotSource for BinanceRest {
    async fn fetch_snapshot(&self, symbol: &str) -> SyncResult<OrderBookSnapshot> {
        let symbol = symbol.to_uppercase();
        info!(url = %self.depth_url, symbol = %symbol, limit = self.limit, "fetching depth snapshot");

        let limit = self.limit.to_string();
        let res = self
            .client
            .get(&self.depth_url)
            .query(&[("symbol", symbol.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|e| SyncError::Upstream(format!("snapshot request failed: {e}")))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| SyncError::Upstream(format!("snapshot body read failed: {e}")))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ApiError>(&body)
                .map(|e| format!("{} (code {})", e.msg, e.code))
                .unwrap_or(body);
            return Err(SyncError::Upstream(format!("snapshot HTTP {status}: {detail}")));
        }

        let snapshot = parse_snapshot(&body, &self.normaliser)?;
        debug!(
            symbol = %symbol,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "depth snapshot received"
        );
        Ok(snapshot)
    }
}

pub fn parse_snapshot(body: &str, normaliser: &Normaliser) -> SyncResult<OrderBookSnapshot> {
    let raw: DepthSnapshot = serde_json::from_str(body)
        .map_err(|e| SyncError::Upstream(format!("malformed snapshot: {e}")))?;
    let levels = |side: &[[String; 2]]| {
        normaliser
            .levels(side)
            .map_err(|e| SyncError::Upstream(format!("unusable snapshot level: {e}")))
    };
    Ok(OrderBookSnapshot {
        bids: levels(&raw.bids)?,
        asks: levels(&raw.asks)?,
        last_update_id: raw.last_update_id,
    })
}

/// Websocket URL of the diff stream for `symbol`, e.g. `.../ws/btcusdt@depth@100ms`.
pub fn stream_url(venue: &VenueConfig, symbol: &str) -> String {
    format!(
        "{}/{}{}",
        venue.ws_url.trim_end_matches('/'),
        symbol.to_lowercase(),
        venue.stream_suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::PriceLevel;

    const SNAPSHOT_JSON: &str = r#"{
        "lastUpdateId": 1027024,
        "E": 1589436922972,
        "T": 1589436922959,
        "bids": [["4.00000000", "431.00000000"]],
        "asks": [["4.00000200", "12.00000000"]]
    }"#;

    #[test]
    fn test_parse_snapshot() {
        let snap = parse_snapshot(SNAPSHOT_JSON, &Normaliser::new(8, 8)).unwrap();
        assert_eq!(snap.last_update_id, 1_027_024);
        assert_eq!(snap.bids, vec![PriceLevel::new(400_000_000, 43_100_000_000)]);
        assert_eq!(snap.asks, vec![PriceLevel::new(400_000_200, 1_200_000_000)]);
    }

    #[test]
    fn test_malformed_snapshot_is_upstream_error() {
        let err = parse_snapshot(r#"{"bids":[]}"#, &Normaliser::new(8, 8)).unwrap_err();
        assert!(matches!(err, SyncError::Upstream(_)));
    }

    #[test]
    fn test_excess_precision_snapshot_is_upstream_error() {
        let body = r#"{"lastUpdateId":7,"bids":[["100.123","1"]],"asks":[]}"#;
        let err = parse_snapshot(body, &Normaliser::new(2, 3)).unwrap_err();
        assert!(matches!(err, SyncError::Upstream(_)), "got {err:?}");
    }

    #[test]
    fn test_stream_url() {
        let venue = VenueConfig::default();
        assert_eq!(stream_url(&venue, "BTCUSDT"), "wss://fstream.binance.com/ws/btcusdt@depth@100ms");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_upstream_error() {
        let venue = VenueConfig { rest_url: "http://127.0.0.1:1".into(), ..Default::default() };
        let rest = BinanceRest::new(&venue, &BookConfig::default()).unwrap();
        let err = rest.fetch_snapshot("btcusdt").await.unwrap_err();
        assert!(matches!(err, SyncError::Upstream(_)), "got {err:?}");
    }
}
