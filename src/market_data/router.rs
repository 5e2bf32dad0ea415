// Router: the consumer-facing entry point. Owns the connection registry
// and one sync driver per subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::SyncConfig;
use crate::engine::aggregator::{DepthView, WallEvent};
use crate::error::{SyncError, SyncResult};
use crate::market_data::adapters::binance::{stream_url, BinanceRest};
use crate::market_data::adapters::SnapshotSource;
use crate::market_data::sync::{BookStatus, Controls, Outputs, SyncDriver};
use crate::net::registry::ConnectionRegistry;
use crate::net::transport::Transport;
use crate::net::ws::WsTransport;

const WALL_EVENT_BUFFER: usize = 256;

struct Driver {
    connection: String,
    task: JoinHandle<()>,
}

struct FeedInner {
    config: SyncConfig,
    source: Arc<dyn SnapshotSource>,
    registry: ConnectionRegistry,
    drivers: Mutex<AHashMap<u64, Driver>>,
    next_id: AtomicU64,
}

impl FeedInner {
    fn stop(&self, id: u64) {
        let removed = self.drivers.lock().remove(&id);
        if let Some(driver) = removed {
            driver.task.abort();
            self.registry.remove(&driver.connection);
        }
    }
}

/// Live depth for any number of symbols.
///
/// Each [`subscribe`](Self::subscribe) gets its own stream connection and
/// book. Views, wall events and status are pushed over channels; nothing on
/// the consumer side can observe a book mid-update.
pub struct DepthFeed {
    inner: Arc<FeedInner>,
}

impl DepthFeed {
    pub fn new(config: SyncConfig, source: Arc<dyn SnapshotSource>, transport: Arc<dyn Transport>) -> Self {
        let registry = ConnectionRegistry::new(transport, config.connection.clone());
        Self {
            inner: Arc::new(FeedInner {
                config,
                source,
                registry,
                drivers: Mutex::new(AHashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Feed wired to the configured Binance endpoints.
    pub fn binance(config: SyncConfig) -> SyncResult<Self> {
        let rest = BinanceRest::new(&config.venue, &config.book)?;
        Ok(Self::new(config, Arc::new(rest), Arc::new(WsTransport::default())))
    }

    /// Start syncing `symbol`. Must be called from within a tokio runtime.
    pub fn subscribe(&self, symbol: &str) -> SyncResult<BookSubscription> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(SyncError::Protocol("empty symbol".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let key = format!("{}#{id}", symbol.to_lowercase());
        let connection = self.inner.registry.get_or_create(&key)?;

        let (views_tx, views) = watch::channel(None);
        let (walls, _) = broadcast::channel(WALL_EVENT_BUFFER);
        let (status_tx, status) = watch::channel(BookStatus::Syncing);
        let out = Outputs { views: views_tx, walls: walls.clone(), status: status_tx };
        let (refresh, refresh_rx) = mpsc::channel(1);
        let controls = Controls { refresh: refresh_rx };

        let url = stream_url(&self.inner.config.venue, &symbol);
        let driver = SyncDriver::new(&symbol, url, &self.inner.config, connection, self.inner.source.clone(), out, controls);
        let task = tokio::spawn(driver.run());
        self.inner.drivers.lock().insert(id, Driver { connection: key, task });
        info!(symbol = %symbol, id, "subscribed");

        Ok(BookSubscription { id, symbol, views, walls, status, refresh, feed: Arc::downgrade(&self.inner) })
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.drivers.lock().len()
    }

    /// Stop every subscription and close every connection.
    pub fn shutdown(&self) {
        let drivers: Vec<Driver> = self.inner.drivers.lock().drain().map(|(_, d)| d).collect();
        for driver in &drivers {
            driver.task.abort();
        }
        self.inner.registry.shutdown();
        info!(stopped = drivers.len(), "depth feed shut down");
    }
}

impl Drop for DepthFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to one symbol's live book. Dropping it unsubscribes.
pub struct BookSubscription {
    id: u64,
    symbol: String,
    views: watch::Receiver<Option<DepthView>>,
    walls: broadcast::Sender<WallEvent>,
    status: watch::Receiver<BookStatus>,
    refresh: mpsc::Sender<()>,
    feed: Weak<FeedInner>,
}

impl BookSubscription {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Latest aggregated view; `None` while no live book exists.
    pub fn views(&self) -> watch::Receiver<Option<DepthView>> {
        self.views.clone()
    }

    pub fn current_view(&self) -> Option<DepthView> {
        self.views.borrow().clone()
    }

    /// Walls as they appear. Each receiver sees events sent after it subscribed.
    pub fn walls(&self) -> broadcast::Receiver<WallEvent> {
        self.walls.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<BookStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> BookStatus {
        self.status.borrow().clone()
    }

    /// Throw the book away and rebuild it from a fresh snapshot.
    ///
    /// Ignored while the stream is down; the next open bootstraps anyway.
    /// Returns `false` once the subscription has stopped.
    pub fn refresh(&self) -> bool {
        match self.refresh.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        }
    }

    /// Stop syncing and close this subscription's connection.
    pub fn unsubscribe(self) {}
}

impl Drop for BookSubscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.stop(self.id);
            info!(symbol = %self.symbol, id = self.id, "unsubscribed");
        }
    }
}
