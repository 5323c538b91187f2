//! Socket pumps for one peer connection.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsjrpc_rpc::{Connection, Endpoint};

/// Client-side socket type.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Feed inbound frames to `endpoint` until the socket ends or `shutdown`
/// fires, then release everything tied to `connection` and fire `ended`.
pub(crate) async fn read_loop(
    mut ws_rx: SplitStream<WsStream>,
    endpoint: Endpoint,
    connection: Arc<Connection>,
    shutdown: CancellationToken,
    ended: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = shutdown.cancelled() => break,
        };
        match frame {
            Some(Ok(Message::Text(text))) => endpoint.handle_text(&connection, text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => endpoint.handle_text(&connection, text),
                Err(_) => warn!(len = data.len(), "received non-UTF8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "hub closed the connection");
                break;
            }
            // Pongs are queued by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                warn!(%error, "websocket error");
                break;
            }
            None => break,
        }
    }

    connection.mark_closed();
    let released = endpoint.release_connection(connection.id());
    info!(
        connection = %connection.id(),
        cancelled_calls = released.cancelled_calls,
        "disconnected"
    );
    shutdown.cancel();
    ended.cancel();
}

/// Drain the outbound queue onto the socket until `shutdown` fires.
pub(crate) async fn write_loop(
    mut ws_tx: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            // Queued frames go out before a requested close.
            biased;
            frame = rx.recv() => {
                let Some(text) = frame else { break };
                if let Err(error) = ws_tx.send(Message::Text(String::clone(&text).into())).await {
                    warn!(%error, "send failed");
                    break;
                }
            }
            () = shutdown.cancelled() => break,
        }
    }
    let _ = ws_tx.close().await;
}
