use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SyncResult;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Application close code used when heartbeats go unanswered.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_NORMAL, reason)
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

/// Transport-level frame, independent of the websocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(CloseInfo),
}

/// An open transport: frames to send and frames received.
///
/// Dropping `outbound` (all clones) tells the transport to shut down. The
/// inbound channel ends once the remote side is gone.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a transport to `url`. Resolves once the remote side accepted it.
    async fn connect(&self, url: &str) -> SyncResult<TransportLink>;
}
