//! Per-connection read/write pumps.
//!
//! ```text
//!            ┌────────────── WebSocket ───────────────┐
//!            │                                         │
//!   read_pump: frame ──► hub.broadcast()     write_pump: outbound.recv() ──► text frame
//!            │                                         │
//!            └─ on exit: hub.unregister()   ◄── stop ──┘ on exit: close frame
//! ```
//!
//! The pumps share nothing but the hub handle and a stop signal. The hub
//! closes the outbound queue on removal, which ends the writer; the writer
//! then tells the reader to stop so a silent peer cannot pin the task.

use std::io::ErrorKind;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Bytes, Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::hub::{ConnectionId, HubHandle};
use crate::registry::Membership;

/// One client connection after registration.
pub struct Connection {
    id: ConnectionId,
    hub: HubHandle,
    outbound: mpsc::Receiver<Utf8Bytes>,
}

impl Connection {
    pub fn new(membership: Membership) -> Self {
        Self {
            id: membership.id,
            hub: membership.hub,
            outbound: membership.outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Split the transport and start both pumps.
    ///
    /// Returns the (reader, writer) task handles.
    pub fn spawn<S>(self, ws: WebSocketStream<S>) -> (JoinHandle<()>, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (stop_tx, stop_rx) = oneshot::channel();

        let writer = tokio::spawn(write_pump(sink, self.outbound, self.id, stop_tx));
        let reader = tokio::spawn(read_pump(stream, self.hub, self.id, stop_rx));
        (reader, writer)
    }
}

/// Drain the outbound queue into text frames until the hub closes it.
async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    id: ConnectionId,
    stop: oneshot::Sender<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(text) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!("Write to {id} failed: {e}");
            break;
        }
    }
    // Closing the receiver makes later fan-outs see this member as gone
    drop(outbound);

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    let _ = stop.send(());
    trace!("Writer for {id} finished");
}

/// Forward inbound frames to the hub until the transport ends.
async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    hub: HubHandle,
    id: ConnectionId,
    mut stop: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut stop => {
                debug!("Reader for {id} stopped by writer");
                break;
            }
        };

        let raw: Bytes = match frame {
            Some(Ok(Message::Text(text))) => text.into(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                log_close(id, frame.as_ref());
                break;
            }
            // Pings are answered by tungstenite
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Err(e)) => {
                if is_expected_close(&e) {
                    debug!("Connection {id} closed: {e}");
                } else {
                    error!("Unexpected error on connection {id}: {e}");
                }
                break;
            }
            None => break,
        };

        if hub.broadcast(id, raw).await.is_err() {
            break;
        }
    }

    let _ = hub.unregister(id).await;
    trace!("Reader for {id} finished");
}

fn log_close(id: ConnectionId, frame: Option<&CloseFrame>) {
    match frame {
        Some(frame) if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            warn!(
                "Connection {id} closed with code {}: {}",
                u16::from(frame.code),
                frame.reason
            );
        }
        _ => debug!("Connection {id} closed by peer"),
    }
}

/// Going-away and abnormal closures are routine; everything else is worth an error log.
fn is_expected_close(err: &tungstenite::Error) -> bool {
    use tungstenite::error::ProtocolError;
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_expected_close_classification() {
        assert!(is_expected_close(&tungstenite::Error::ConnectionClosed));
        assert!(is_expected_close(&tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
        )));
        assert!(is_expected_close(&tungstenite::Error::Io(io::Error::from(
            ErrorKind::ConnectionReset
        ))));
        assert!(!is_expected_close(&tungstenite::Error::Io(io::Error::from(
            ErrorKind::PermissionDenied
        ))));
        assert!(!is_expected_close(&tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::SendAfterClosing
        )));
    }
}
