//! Per-symbol sync driver.
//!
//! One task owns the [`Reconciler`] and with it the book. Connection
//! events, snapshot results and render ticks are arms of a single
//! `select!`, so a view is only ever sampled between whole diffs.
//!
//! Bootstrap starts on every connection open. Resyncs (sequence gap, lost
//! events, undecodable depth update) restart it with a fresh epoch; the
//! in-flight snapshot fetch is aborted and any late result is ignored.
//! A consumer refresh restarts it the same way but does not count against
//! the resync budget.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{BreakerError, CircuitBreaker, CircuitState};
use crate::config::SyncConfig;
use crate::engine::aggregator::{DepthView, LevelAggregator, WallEvent, WallTracker};
use crate::engine::reconcile::{DiffOutcome, Reconciler, SeedOutcome};
use crate::engine::types::OrderBookSnapshot;
use crate::error::{SyncError, SyncResult};
use crate::market_data::adapters::SnapshotSource;
use crate::market_data::diff_stream::DiffStream;
use crate::market_data::normaliser::Normaliser;
use crate::net::manager::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::net::scheduler::Scheduler;
use crate::telemetry::{DIFFS_APPLIED_TOTAL, GAPS_TOTAL, LAST_UPDATE_ID, RESYNCS_TOTAL};

/// Health of one subscription's book, as seen by its consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum BookStatus {
    /// Bootstrapping; no trustworthy book yet.
    Syncing,
    Live,
    /// The snapshot endpoint is failing; retries continue.
    Degraded(#[serde(serialize_with = "as_display")] SyncError),
    /// Terminal. The subscription has stopped.
    Unavailable(#[serde(serialize_with = "as_display")] SyncError),
}

fn as_display<S: serde::Serializer>(e: &SyncError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(e)
}

impl BookStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookStatus::Unavailable(_))
    }
}

/// Senders through which the driver publishes to its subscription.
pub(crate) struct Outputs {
    pub views: watch::Sender<Option<DepthView>>,
    pub walls: broadcast::Sender<WallEvent>,
    pub status: watch::Sender<BookStatus>,
}

/// Consumer requests into the driver.
pub(crate) struct Controls {
    pub refresh: mpsc::Receiver<()>,
}

type SnapshotResult = (u64, SyncResult<OrderBookSnapshot>);

pub(crate) struct SyncDriver {
    symbol: String,
    url: String,
    snapshot_timeout: Duration,
    snapshot_retry_delay: Duration,
    render_interval: Duration,
    max_resync_attempts: u32,
    connection: Arc<ConnectionManager>,
    source: Arc<dyn SnapshotSource>,
    breaker: Arc<CircuitBreaker>,
    diffs: DiffStream,
    reconciler: Reconciler,
    aggregator: LevelAggregator,
    walls: WallTracker,
    out: Outputs,
    controls: Controls,
    fetches: Scheduler,
    snapshot_tx: mpsc::Sender<SnapshotResult>,
    snapshot_rx: mpsc::Receiver<SnapshotResult>,
    resyncs: u32,
    degraded: bool,
    dirty: bool,
    done: bool,
}

impl SyncDriver {
    pub(crate) fn new(
        symbol: &str,
        url: String,
        config: &SyncConfig,
        connection: Arc<ConnectionManager>,
        source: Arc<dyn SnapshotSource>,
        out: Outputs,
        controls: Controls,
    ) -> Self {
        let symbol = symbol.to_uppercase();
        let normaliser = Normaliser::from_venue(&config.venue);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(4);
        Self {
            breaker: Arc::new(CircuitBreaker::from_config(format!("snapshot:{symbol}"), &config.breaker)),
            diffs: DiffStream::new(&symbol, normaliser),
            reconciler: Reconciler::new(config.book.max_buffered_diffs),
            aggregator: LevelAggregator::new(
                config.view.visible_depth,
                config.view.wall_threshold_bps(),
                normaliser.price_decimals(),
            ),
            walls: WallTracker::new(),
            snapshot_timeout: config.book.snapshot_timeout(),
            snapshot_retry_delay: config.book.snapshot_retry_delay(),
            render_interval: config.view.render_interval().max(Duration::from_millis(1)),
            max_resync_attempts: config.book.max_resync_attempts,
            symbol,
            url,
            connection,
            source,
            out,
            controls,
            fetches: Scheduler::new(),
            snapshot_tx,
            snapshot_rx,
            resyncs: 0,
            degraded: false,
            dirty: false,
            done: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut events = self.connection.subscribe();
        self.set_status(BookStatus::Syncing);

        // the Open event arrives on `events` and starts the bootstrap
        match self.connection.connect(&self.url).await {
            Ok(()) => {}
            Err(SyncError::Closed) => return,
            Err(e) => warn!(symbol = %self.symbol, error = %e, "initial connect failed, retrying in background"),
        }

        let mut render = tokio::time::interval(self.render_interval);
        render.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.done {
            tokio::select! {
                event = events.recv() => self.on_connection_event(event),
                Some((epoch, result)) = self.snapshot_rx.recv() => self.on_snapshot(epoch, result),
                Some(()) = self.controls.refresh.recv() => self.refresh(),
                _ = render.tick() => self.render(),
            }
        }

        self.fetches.cancel_all();
        self.connection.disconnect();
        debug!(symbol = %self.symbol, "sync driver stopped");
    }

    fn on_connection_event(&mut self, event: Result<ConnectionEvent, RecvError>) {
        match event {
            Ok(ConnectionEvent::Open) => {
                info!(symbol = %self.symbol, "stream open, bootstrapping book");
                self.start_bootstrap();
            }
            Ok(ConnectionEvent::Message(text)) => self.on_message(&text),
            Ok(ConnectionEvent::Close(close)) => {
                debug!(symbol = %self.symbol, code = close.code, "stream closed, abandoning book");
                self.abandon();
            }
            Ok(ConnectionEvent::Error(e)) => {
                debug!(symbol = %self.symbol, error = %e, "connection error");
            }
            Ok(ConnectionEvent::StateChange { to: ConnectionState::Error, .. }) => {
                error!(symbol = %self.symbol, "stream connection gave up");
                self.abandon();
                self.set_status(BookStatus::Unavailable(SyncError::CannotEstablishBook {
                    symbol: self.symbol.clone(),
                    reason: "stream reconnect attempts exhausted".into(),
                }));
                self.done = true;
            }
            Ok(ConnectionEvent::StateChange { to: ConnectionState::Closed, .. }) => {
                self.abandon();
                self.done = true;
            }
            Ok(ConnectionEvent::StateChange { .. }) => {}
            Err(RecvError::Lagged(missed)) => {
                self.resync(&format!("{missed} stream events lost to lag"));
            }
            Err(RecvError::Closed) => self.done = true,
        }
    }

    fn on_message(&mut self, text: &str) {
        let diff = match self.diffs.parse(text) {
            Ok(Some(diff)) => diff,
            Ok(None) => return,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "undecodable depth update");
                self.resync(&e.to_string());
                return;
            }
        };

        match self.reconciler.on_diff(diff) {
            DiffOutcome::Applied { last_applied_id } => {
                self.resyncs = 0;
                self.dirty = true;
                counter!(DIFFS_APPLIED_TOTAL, "symbol" => self.symbol.clone()).increment(1);
                gauge!(LAST_UPDATE_ID, "symbol" => self.symbol.clone()).set(last_applied_id as f64);
            }
            DiffOutcome::Buffered | DiffOutcome::Stale => {}
            DiffOutcome::Gap(gap) => {
                counter!(GAPS_TOTAL, "symbol" => self.symbol.clone()).increment(1);
                self.resync(&gap.to_string());
            }
        }
    }

    fn on_snapshot(&mut self, epoch: u64, result: SyncResult<OrderBookSnapshot>) {
        if epoch != self.reconciler.epoch() {
            debug!(symbol = %self.symbol, epoch, "dropping snapshot from a retired bootstrap");
            return;
        }

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "snapshot fetch failed");
                if self.breaker.state() == CircuitState::Open && !self.degraded {
                    self.degraded = true;
                    self.set_status(BookStatus::Degraded(SyncError::CannotEstablishBook {
                        symbol: self.symbol.clone(),
                        reason: e.to_string(),
                    }));
                }
                self.spawn_fetch(epoch, self.snapshot_retry_delay);
                return;
            }
        };

        match self.reconciler.on_snapshot(epoch, &snapshot) {
            SeedOutcome::Live { dropped, replayed, last_applied_id } => {
                info!(symbol = %self.symbol, last_applied_id, dropped, replayed, "book live");
                if replayed > 0 {
                    self.resyncs = 0;
                }
                self.degraded = false;
                self.dirty = true;
                gauge!(LAST_UPDATE_ID, "symbol" => self.symbol.clone()).set(last_applied_id as f64);
                self.set_status(BookStatus::Live);
                self.render();
            }
            SeedOutcome::Ignored => {}
            SeedOutcome::Gap(gap) => {
                counter!(GAPS_TOTAL, "symbol" => self.symbol.clone()).increment(1);
                self.resync(&format!("snapshot does not join the stream: {gap}"));
            }
        }
    }

    fn resync(&mut self, reason: &str) {
        self.resyncs += 1;
        counter!(RESYNCS_TOTAL, "symbol" => self.symbol.clone()).increment(1);
        if self.resyncs > self.max_resync_attempts {
            error!(symbol = %self.symbol, attempts = self.max_resync_attempts, reason, "giving up on book");
            self.abandon();
            self.set_status(BookStatus::Unavailable(SyncError::BookUnavailable {
                symbol: self.symbol.clone(),
                resyncs: self.max_resync_attempts,
            }));
            self.done = true;
            return;
        }
        warn!(symbol = %self.symbol, attempt = self.resyncs, reason, "resyncing book");
        self.start_bootstrap();
    }

    fn refresh(&mut self) {
        if self.connection.state() != ConnectionState::Connected {
            debug!(symbol = %self.symbol, "refresh ignored, stream not connected");
            return;
        }
        info!(symbol = %self.symbol, "refresh requested, rebuilding book");
        self.start_bootstrap();
    }

    fn start_bootstrap(&mut self) {
        self.fetches.cancel_all();
        self.clear_view();
        let epoch = self.reconciler.begin_bootstrap();
        if !self.degraded {
            self.set_status(BookStatus::Syncing);
        }
        self.spawn_fetch(epoch, Duration::ZERO);
    }

    /// Drop the book and wait for the next connection open.
    fn abandon(&mut self) {
        self.fetches.cancel_all();
        self.reconciler.reset();
        self.clear_view();
        if !self.degraded {
            self.set_status(BookStatus::Syncing);
        }
    }

    fn spawn_fetch(&self, epoch: u64, delay: Duration) {
        let source = self.source.clone();
        let breaker = self.breaker.clone();
        let symbol = self.symbol.clone();
        let timeout = self.snapshot_timeout;
        let tx = self.snapshot_tx.clone();
        self.fetches.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = breaker
                .call(|| async {
                    match tokio::time::timeout(timeout, source.fetch_snapshot(&symbol)).await {
                        Ok(res) => res,
                        Err(_) => Err(SyncError::timeout("snapshot fetch", timeout)),
                    }
                })
                .await
                .map_err(|e| match e {
                    BreakerError::Open => SyncError::CircuitOpen,
                    BreakerError::Inner(e) => e,
                });
            let _ = tx.send((epoch, result)).await;
        });
    }

    fn render(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(book) = self.reconciler.book() else {
            return;
        };
        let view = self.aggregator.aggregate(&self.symbol, book);
        for wall in self.walls.update(&view) {
            debug!(symbol = %self.symbol, side = ?wall.side, price = wall.price, share_bps = wall.share_bps, "wall detected");
            let _ = self.out.walls.send(wall);
        }
        self.out.views.send_replace(Some(view));
        self.dirty = false;
    }

    fn clear_view(&mut self) {
        self.walls.clear();
        self.dirty = false;
        self.out.views.send_if_modified(|v| v.take().is_some());
    }

    fn set_status(&self, status: BookStatus) {
        self.out.status.send_if_modified(|s| {
            if *s == status {
                return false;
            }
            debug!(symbol = %self.symbol, from = ?s, to = ?status, "book status");
            *s = status;
            true
        });
    }
}
