use std::borrow::Cow;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::net::transport::{CloseInfo, Frame, Transport, TransportLink};

/// Upper bound on the closing handshake once the writer is done.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`Transport`] over tokio-tungstenite.
///
/// Each connection gets a reader and a writer pump bridging the socket to
/// the frame channels of its [`TransportLink`]. Dropping the link stops
/// both: the writer sees its channel end, and the reader stops once the
/// inbound receiver is gone or the writer has finished, even if the peer
/// has gone silent.
#[derive(Debug, Clone)]
pub struct WsTransport {
    channel_capacity: usize,
}

impl WsTransport {
    pub fn new(channel_capacity: usize) -> Self {
        Self { channel_capacity: channel_capacity.max(1) }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> SyncResult<TransportLink> {
        debug!(url, "opening websocket");
        let (ws_stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::Transport(format!("connect to {url} failed: {e}")))?;
        debug!(url, status = %response.status(), "websocket open");

        let (sink, stream) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel::<Frame>(self.channel_capacity);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(self.channel_capacity);
        let (writer_done, writer_stopped) = oneshot::channel();

        tokio::spawn(write_pump(sink, out_rx, writer_done));
        tokio::spawn(read_pump(stream, in_tx, writer_stopped));

        Ok(TransportLink { outbound: out_tx, inbound: in_rx })
    }
}

// Ends when every outbound sender is dropped, after a close frame, or on
// a write error. Dropping `done` stops the reader.
async fn write_pump<K>(mut sink: K, mut out_rx: mpsc::Receiver<Frame>, done: oneshot::Sender<()>)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    while let Some(frame) = out_rx.recv().await {
        let is_close = matches!(frame, Frame::Close(_));
        if let Err(e) = sink.send(to_message(frame)).await {
            trace!(error = %e, "websocket write failed");
            break;
        }
        if is_close {
            break;
        }
    }
    drop(done);
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!("websocket close timed out");
    }
}

async fn read_pump<S>(mut stream: S, in_tx: mpsc::Sender<Frame>, mut writer_stopped: oneshot::Receiver<()>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = in_tx.closed() => break,
            _ = &mut writer_stopped => {
                let _ = in_tx.try_send(Frame::Close(CloseInfo::abnormal("writer stopped")));
                break;
            }
            next = stream.next() => next,
        };
        let frame = match next {
            Some(Ok(Message::Text(text))) => Frame::Text(text),
            // tungstenite queues the pong reply itself
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Pong(p))) => Frame::Pong(p),
            Some(Ok(Message::Close(frame))) => {
                let info = frame
                    .map(|f| CloseInfo::new(u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or_else(|| CloseInfo::abnormal("closed without status"));
                let _ = in_tx.send(Frame::Close(info)).await;
                break;
            }
            Some(Ok(Message::Binary(_))) | Some(Ok(Message::Frame(_))) => {
                trace!("ignoring non-text frame");
                continue;
            }
            Some(Err(e)) => {
                warn!(error = %e, "websocket read error");
                let _ = in_tx.send(Frame::Close(CloseInfo::abnormal(e.to_string()))).await;
                break;
            }
            None => {
                let _ = in_tx.send(Frame::Close(CloseInfo::abnormal("stream ended"))).await;
                break;
            }
        };
        if in_tx.send(frame).await.is_err() {
            break;
        }
    }
    trace!("websocket reader stopped");
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Ping(p) => Message::Ping(p),
        Frame::Pong(p) => Message::Pong(p),
        Frame::Close(info) => Message::Close(Some(CloseFrame {
            code: CloseCode::from(info.code),
            reason: Cow::Owned(info.reason),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_conversion() {
        match to_message(Frame::Close(CloseInfo::new(4000, "heartbeat timeout"))) {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4000);
                assert_eq!(frame.reason, "heartbeat timeout");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn test_ping_payload_preserved() {
        assert_eq!(to_message(Frame::Ping(vec![1, 2, 3])), Message::Ping(vec![1, 2, 3]));
        assert_eq!(to_message(Frame::Text("x".into())), Message::Text("x".into()));
    }

    fn silent_peer() -> futures::stream::Pending<Result<Message, WsError>> {
        futures::stream::pending()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_stops_when_link_dropped() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (_writer_done, writer_stopped) = oneshot::channel::<()>();
        let reader = tokio::spawn(read_pump(silent_peer(), in_tx, writer_stopped));
        drop(in_rx);
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader outlived its link")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_stops_with_writer() {
        let (in_tx, mut in_rx) = mpsc::channel(4);
        let (writer_done, writer_stopped) = oneshot::channel::<()>();
        let reader = tokio::spawn(read_pump(silent_peer(), in_tx, writer_stopped));
        drop(writer_done);
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader outlived the writer")
            .unwrap();
        assert!(matches!(in_rx.recv().await, Some(Frame::Close(info)) if !info.is_normal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_ends_after_close_frame() {
        let (sink, mut sent) = futures::channel::mpsc::unbounded::<Message>();
        let (out_tx, out_rx) = mpsc::channel(4);
        let (writer_done, mut writer_stopped) = oneshot::channel();
        let writer = tokio::spawn(write_pump(sink, out_rx, writer_done));

        out_tx.send(Frame::Text("sub".into())).await.unwrap();
        out_tx.send(Frame::Close(CloseInfo::new(4000, "heartbeat timeout"))).await.unwrap();
        writer.await.unwrap();

        assert!(writer_stopped.try_recv().is_err());
        assert_eq!(sent.next().await, Some(Message::Text("sub".into())));
        assert!(matches!(sent.next().await, Some(Message::Close(Some(_)))));
        // the link may still be alive; the pump no longer listens to it
        assert!(out_tx.send(Frame::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let transport = WsTransport::default();
        let err = transport.connect("ws://127.0.0.1:1/ws").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)), "got {err:?}");
    }
}
