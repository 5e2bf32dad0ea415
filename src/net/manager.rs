//! Resilient streaming connection: open, heartbeat, backoff reconnect.
//!
//! All mutable state sits behind one lock in [`Shared`]. The driver task
//! carries the session number it was spawned with, and every transition it
//! makes is checked against the current session, so a driver outliving a
//! `disconnect()` can never resurrect the connection.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{SyncError, SyncResult};
use crate::net::backoff;
use crate::net::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::net::scheduler::Scheduler;
use crate::net::transport::{CloseInfo, Frame, Transport, TransportLink, CLOSE_HEARTBEAT_TIMEOUT};
use crate::telemetry::{HEARTBEAT_EXPIRED_TOTAL, RECONNECTS_TOTAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    Message(String),
    Close(CloseInfo),
    Error(SyncError),
    StateChange { from: ConnectionState, to: ConnectionState },
}

#[derive(Debug, Default)]
struct Control {
    auto_reconnect: bool,
    destroyed: bool,
    outbound: Option<mpsc::Sender<Frame>>,
    attempt: u32,
    session: u64,
}

#[derive(Debug)]
struct Shared {
    name: String,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    control: Mutex<Control>,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    // Callers hold the control lock so transitions are serialized.
    fn transition(&self, to: ConnectionState) {
        let mut from = to;
        let changed = self.state.send_if_modified(|s| {
            if *s == to {
                return false;
            }
            from = *s;
            *s = to;
            true
        });
        if changed {
            debug!(connection = %self.name, ?from, ?to, "state change");
            self.emit(ConnectionEvent::StateChange { from, to });
        }
    }

    fn on_open(&self, session: u64, outbound: mpsc::Sender<Frame>) -> bool {
        let mut ctl = self.control.lock();
        if ctl.session != session {
            let _ = outbound.try_send(Frame::Close(CloseInfo::normal("superseded")));
            return false;
        }
        ctl.attempt = 0;
        ctl.outbound = Some(outbound);
        self.transition(ConnectionState::Connected);
        self.emit(ConnectionEvent::Open);
        true
    }

    /// Returns whether the driver should reconnect.
    fn on_close(&self, session: u64, close: CloseInfo) -> bool {
        let mut ctl = self.control.lock();
        if ctl.session != session {
            return false;
        }
        ctl.outbound = None;
        let reconnect = !close.is_normal() && ctl.auto_reconnect;
        self.emit(ConnectionEvent::Close(close));
        if reconnect {
            self.transition(ConnectionState::Connecting);
        } else {
            self.transition(ConnectionState::Disconnected);
        }
        reconnect
    }

    /// Claim the next reconnect attempt, or park in `Error` once the budget is spent.
    fn next_attempt(&self, session: u64, max_attempts: u32) -> Option<u32> {
        let mut ctl = self.control.lock();
        if ctl.session != session || !ctl.auto_reconnect {
            return None;
        }
        ctl.attempt += 1;
        if ctl.attempt > max_attempts {
            error!(connection = %self.name, attempts = max_attempts, "reconnect attempts exhausted");
            self.transition(ConnectionState::Error);
            return None;
        }
        self.transition(ConnectionState::Connecting);
        Some(ctl.attempt)
    }
}

/// A named, self-healing streaming connection.
///
/// Consumers observe it through [`subscribe`](Self::subscribe) (typed events)
/// and [`watch_state`](Self::watch_state); the only write path is
/// [`send`](Self::send).
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    scheduler: Scheduler,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let shared = Shared { name: name.into(), state, events, control: Mutex::new(Control::default()) };
        Self { transport, config, shared: Arc::new(shared), scheduler: Scheduler::new() }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.control.lock().attempt
    }

    /// Open the connection to `url` and keep it open until told otherwise.
    ///
    /// Resolves when the first attempt opens or fails. A failed first attempt
    /// still leaves the reconnect schedule running in the background.
    pub async fn connect(&self, url: &str) -> SyncResult<()> {
        let mut events = self.shared.events.subscribe();
        let session = {
            let mut ctl = self.shared.control.lock();
            if ctl.destroyed {
                return Err(SyncError::Closed);
            }
            if matches!(self.state(), ConnectionState::Connecting | ConnectionState::Connected) {
                debug!(connection = %self.shared.name, "connect ignored, already active");
                return Ok(());
            }
            ctl.auto_reconnect = true;
            ctl.attempt = 0;
            ctl.session += 1;
            self.shared.transition(ConnectionState::Connecting);
            ctl.session
        };

        info!(connection = %self.shared.name, url, "connecting");
        let driver = drive(
            self.shared.clone(),
            self.transport.clone(),
            self.config.clone(),
            url.to_string(),
            session,
        );
        if !self.scheduler.spawn(driver) {
            return Err(SyncError::Closed);
        }

        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Open) => return Ok(()),
                Ok(ConnectionEvent::Error(e)) => return Err(e),
                Ok(ConnectionEvent::StateChange { to: ConnectionState::Closed, .. }) => {
                    return Err(SyncError::Closed)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => match self.state() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed => return Err(SyncError::Closed),
                    _ => {}
                },
                Err(RecvError::Closed) => return Err(SyncError::Closed),
            }
        }
    }

    /// Queue a text frame. Returns `false` unless the connection is open.
    pub fn send(&self, text: impl Into<String>) -> bool {
        let ctl = self.shared.control.lock();
        if self.state() != ConnectionState::Connected {
            return false;
        }
        match &ctl.outbound {
            Some(tx) => tx.try_send(Frame::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// Close normally, stop reconnecting and cancel pending work.
    /// A later [`connect`](Self::connect) starts afresh.
    pub fn disconnect(&self) {
        self.shutdown(false);
    }

    /// Like [`disconnect`](Self::disconnect), and refuse any further connect.
    pub fn destroy(&self) {
        self.shutdown(true);
    }

    fn shutdown(&self, destroy: bool) {
        {
            let mut ctl = self.shared.control.lock();
            ctl.auto_reconnect = false;
            ctl.session += 1;
            ctl.destroyed |= destroy;
            if let Some(tx) = ctl.outbound.take() {
                let close = CloseInfo::normal("client disconnect");
                let _ = tx.try_send(Frame::Close(close.clone()));
                self.shared.emit(ConnectionEvent::Close(close));
            }
            self.shared.transition(ConnectionState::Closed);
        }
        if destroy {
            self.scheduler.close();
        } else {
            self.scheduler.cancel_all();
        }
        info!(connection = %self.shared.name, destroy, "connection shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if !self.scheduler.is_closed() {
            self.shutdown(true);
        }
    }
}

async fn drive(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    url: String,
    session: u64,
) {
    loop {
        match tokio::time::timeout(config.connect_timeout(), transport.connect(&url)).await {
            Ok(Ok(link)) => {
                let outbound = link.outbound.clone();
                if !shared.on_open(session, outbound) {
                    return;
                }
                info!(connection = %shared.name, url = %url, "connected");
                let close = run_session(&shared, link, &config).await;
                info!(connection = %shared.name, code = close.code, reason = %close.reason, "connection closed");
                if !shared.on_close(session, close) {
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!(connection = %shared.name, error = %e, "connect failed");
                shared.emit(ConnectionEvent::Error(e));
            }
            Err(_) => {
                let e = SyncError::timeout("connect", config.connect_timeout());
                warn!(connection = %shared.name, error = %e, "connect timed out");
                shared.emit(ConnectionEvent::Error(e));
            }
        }

        let Some(attempt) = shared.next_attempt(session, config.max_reconnect_attempts) else {
            return;
        };
        let delay = backoff::reconnect_delay(attempt, &config);
        counter!(RECONNECTS_TOTAL, "connection" => shared.name.clone()).increment(1);
        info!(connection = %shared.name, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::time::sleep(delay).await;
    }
}

/// Pump one open transport until it closes. Returns why it closed.
async fn run_session(shared: &Shared, mut link: TransportLink, config: &ConnectionConfig) -> CloseInfo {
    // tokio intervals panic on a zero period
    let period = config.heartbeat_interval().max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut monitor = HeartbeatMonitor::new(config.heartbeat_timeout(), config.max_missed_heartbeats);

    loop {
        tokio::select! {
            frame = link.inbound.recv() => match frame {
                Some(Frame::Text(text)) => shared.emit(ConnectionEvent::Message(text)),
                Some(Frame::Pong(payload)) => {
                    if !monitor.on_pong(&payload, Instant::now()) {
                        debug!(connection = %shared.name, "unsolicited pong");
                    }
                }
                Some(Frame::Ping(payload)) => {
                    let _ = link.outbound.try_send(Frame::Pong(payload));
                }
                Some(Frame::Close(info)) => return info,
                None => return CloseInfo::abnormal("transport dropped"),
            },
            _ = ticker.tick() => match monitor.on_tick(Instant::now()) {
                HeartbeatAction::Ping(payload) => {
                    if let Err(TrySendError::Closed(_)) = link.outbound.try_send(Frame::Ping(payload)) {
                        return CloseInfo::abnormal("transport writer gone");
                    }
                }
                HeartbeatAction::Wait => {}
                HeartbeatAction::Expired { missed } => {
                    warn!(connection = %shared.name, missed, "heartbeat expired, forcing reconnect");
                    counter!(HEARTBEAT_EXPIRED_TOTAL, "connection" => shared.name.to_string()).increment(1);
                    let info = CloseInfo::new(CLOSE_HEARTBEAT_TIMEOUT, format!("{missed} heartbeats unanswered"));
                    let _ = link.outbound.try_send(Frame::Close(info.clone()));
                    shared.emit(ConnectionEvent::Error(SyncError::timeout("heartbeat", config.heartbeat_timeout())));
                    return info;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory::{MemoryTransport, RemotePeer};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            max_reconnect_attempts: 3,
            base_reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 1_000,
            max_jitter_ms: 0,
            connect_timeout_ms: 500,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 500,
            max_missed_heartbeats: 2,
            event_buffer: 64,
        }
    }

    fn manager(config: ConnectionConfig) -> (ConnectionManager, MemoryTransport, UnboundedReceiver<RemotePeer>) {
        let (transport, peers) = MemoryTransport::new();
        let mgr = ConnectionManager::new("test", Arc::new(transport.clone()), config);
        (mgr, transport, peers)
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_delivers_messages() {
        let (mgr, _transport, mut peers) = manager(fast_config());
        let mut events = mgr.subscribe();
        mgr.connect("mem://feed").await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Connected);

        let peer = peers.recv().await.unwrap();
        assert_eq!(peer.url, "mem://feed");
        assert!(peer.send_text("hello").await);

        let mut got = None;
        while let Ok(ev) = events.recv().await {
            if let ConnectionEvent::Message(text) = ev {
                got = Some(text);
                break;
            }
        }
        assert_eq!(got.as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_active_is_noop() {
        let (mgr, transport, _peers) = manager(fast_config());
        mgr.connect("mem://feed").await.unwrap();
        mgr.connect("mem://feed").await.unwrap();
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_only_when_connected() {
        let (mgr, _transport, mut peers) = manager(fast_config());
        assert!(!mgr.send("early"));
        mgr.connect("mem://feed").await.unwrap();
        assert!(mgr.send("subscribe"));
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.from_client.recv().await, Some(Frame::Text("subscribe".into())));
        mgr.disconnect();
        assert!(!mgr.send("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_abnormal_close() {
        let (mgr, transport, mut peers) = manager(fast_config());
        let mut state = mgr.watch_state();
        mgr.connect("mem://feed").await.unwrap();
        let peer = peers.recv().await.unwrap();

        peer.drop_connection().await;
        wait_for(&mut state, ConnectionState::Connecting).await;
        wait_for(&mut state, ConnectionState::Connected).await;
        assert_eq!(transport.connects(), 2);
        assert_eq!(mgr.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_still_reconnects() {
        let config = ConnectionConfig { heartbeat_interval_ms: 0, ..fast_config() };
        let (mgr, transport, mut peers) = manager(config);
        let mut state = mgr.watch_state();
        mgr.connect("mem://feed").await.unwrap();
        let peer = peers.recv().await.unwrap();

        peer.drop_connection().await;
        wait_for(&mut state, ConnectionState::Connecting).await;
        wait_for(&mut state, ConnectionState::Connected).await;
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_remote_close_does_not_reconnect() {
        let (mgr, transport, mut peers) = manager(fast_config());
        let mut state = mgr.watch_state();
        mgr.connect("mem://feed").await.unwrap();
        peers.recv().await.unwrap().close_normally().await;

        wait_for(&mut state, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (mgr, transport, _peers) = manager(fast_config());
        let mut state = mgr.watch_state();
        transport.refuse_next(100);

        let err = mgr.connect("mem://feed").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));

        wait_for(&mut state, ConnectionState::Error).await;
        // first attempt plus three retries
        assert_eq!(transport.connects(), 4);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connects(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_means_no_retry() {
        let (mgr, transport, _peers) = manager(ConnectionConfig { max_reconnect_attempts: 0, ..fast_config() });
        transport.refuse_next(1);
        assert!(mgr.connect("mem://feed").await.is_err());
        let mut state = mgr.watch_state();
        wait_for(&mut state, ConnectionState::Error).await;
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (mgr, transport, _peers) = manager(fast_config());
        transport.set_hang(true);
        let err = mgr.connect("mem://feed").await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { operation: "connect", .. }), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_refusals() {
        let (mgr, transport, _peers) = manager(fast_config());
        let mut state = mgr.watch_state();
        transport.refuse_next(2);
        assert!(mgr.connect("mem://feed").await.is_err());
        wait_for(&mut state, ConnectionState::Connected).await;
        assert_eq!(transport.connects(), 3);
        assert_eq!(mgr.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_expiry_forces_reconnect() {
        let (mgr, transport, mut peers) = manager(fast_config());
        transport.set_auto_pong(false);
        let mut events = mgr.subscribe();
        mgr.connect("mem://feed").await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let mut pings = 0;
        let close = loop {
            match peer.from_client.recv().await {
                Some(Frame::Ping(p)) => {
                    assert_eq!(p.len(), 8);
                    pings += 1;
                }
                Some(Frame::Close(info)) => break info,
                other => panic!("unexpected frame {other:?}"),
            }
        };
        assert_eq!(close.code, CLOSE_HEARTBEAT_TIMEOUT);
        assert_eq!(pings, 2);

        let mut saw_timeout = false;
        while let Ok(ev) = events.try_recv() {
            if let ConnectionEvent::Error(SyncError::Timeout { operation: "heartbeat", .. }) = ev {
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);

        // reconnect follows the network-failure path
        let _second = peers.recv().await.unwrap();
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_heartbeats_keep_connection() {
        let (mgr, transport, mut peers) = manager(fast_config());
        mgr.connect("mem://feed").await.unwrap();
        let _peer = peers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (mgr, transport, _peers) = manager(ConnectionConfig {
            base_reconnect_delay_ms: 5_000,
            max_reconnect_delay_ms: 5_000,
            ..fast_config()
        });
        transport.refuse_next(1);
        assert!(mgr.connect("mem://feed").await.is_err());
        mgr.disconnect();
        assert_eq!(mgr.state(), ConnectionState::Closed);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(mgr.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_sends_normal_close_and_allows_reconnect() {
        let (mgr, transport, mut peers) = manager(fast_config());
        mgr.connect("mem://feed").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        mgr.disconnect();
        match peer.from_client.recv().await {
            Some(Frame::Close(info)) => assert!(info.is_normal()),
            other => panic!("expected close, got {other:?}"),
        }
        mgr.connect("mem://feed").await.unwrap();
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_terminal() {
        let (mgr, _transport, _peers) = manager(fast_config());
        mgr.connect("mem://feed").await.unwrap();
        mgr.destroy();
        assert_eq!(mgr.state(), ConnectionState::Closed);
        assert_eq!(mgr.connect("mem://feed").await.unwrap_err(), SyncError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_events_in_order() {
        let (mgr, _transport, _peers) = manager(fast_config());
        let mut events = mgr.subscribe();
        mgr.connect("mem://feed").await.unwrap();
        mgr.disconnect();

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let ConnectionEvent::StateChange { from, to } = ev {
                seen.push((from, to));
            }
        }
        assert_eq!(
            seen,
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
                (ConnectionState::Connected, ConnectionState::Closed),
            ]
        );
    }
}
