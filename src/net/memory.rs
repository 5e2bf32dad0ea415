//! In-process [`Transport`] for driving the connection and sync layers
//! without a network.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};
use crate::net::transport::{CloseInfo, Frame, Transport, TransportLink};

/// Server side of one accepted in-memory connection.
#[derive(Debug)]
pub struct RemotePeer {
    pub url: String,
    pub to_client: mpsc::Sender<Frame>,
    pub from_client: mpsc::Receiver<Frame>,
}

impl RemotePeer {
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Frame::Text(text.into())).await.is_ok()
    }

    /// Simulate a network drop.
    pub async fn drop_connection(&self) {
        let _ = self.to_client.send(Frame::Close(CloseInfo::abnormal("peer dropped"))).await;
    }

    pub async fn close_normally(&self) {
        let _ = self.to_client.send(Frame::Close(CloseInfo::normal("server closing"))).await;
    }
}

#[derive(Debug)]
struct MemoryInner {
    peers: mpsc::UnboundedSender<RemotePeer>,
    refuse_next: u32,
    hang: bool,
    auto_pong: bool,
    connects: u32,
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryTransport {
    /// Returns the transport and the stream of accepted peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemotePeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = MemoryInner { peers: tx, refuse_next: 0, hang: false, auto_pong: true, connects: 0 };
        (Self { inner: Arc::new(Mutex::new(inner)) }, rx)
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: u32) {
        self.inner.lock().refuse_next = n;
    }

    /// Make connection attempts never resolve.
    pub fn set_hang(&self, hang: bool) {
        self.inner.lock().hang = hang;
    }

    /// Answer client pings automatically (on by default).
    pub fn set_auto_pong(&self, on: bool) {
        self.inner.lock().auto_pong = on;
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn connects(&self) -> u32 {
        self.inner.lock().connects
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> SyncResult<TransportLink> {
        let (hang, auto_pong, peers) = {
            let mut inner = self.inner.lock();
            inner.connects += 1;
            if inner.refuse_next > 0 {
                inner.refuse_next -= 1;
                return Err(SyncError::Transport(format!("connection to {url} refused")));
            }
            (inner.hang, inner.auto_pong, inner.peers.clone())
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let (client_out_tx, mut client_out_rx) = mpsc::channel::<Frame>(1_024);
        let (client_in_tx, client_in_rx) = mpsc::channel::<Frame>(1_024);
        let (peer_from_tx, peer_from_rx) = mpsc::channel::<Frame>(1_024);

        let loopback = client_in_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = client_out_rx.recv().await {
                match frame {
                    Frame::Ping(p) if auto_pong => {
                        let _ = loopback.send(Frame::Pong(p)).await;
                    }
                    other => {
                        let _ = peer_from_tx.send(other).await;
                    }
                }
            }
        });

        let peer = RemotePeer { url: url.to_string(), to_client: client_in_tx, from_client: peer_from_rx };
        peers
            .send(peer)
            .map_err(|_| SyncError::Transport("memory listener gone".into()))?;

        Ok(TransportLink { outbound: client_out_tx, inbound: client_in_rx })
    }
}
