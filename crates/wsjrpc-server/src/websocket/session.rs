//! WebSocket session lifecycle: one connected peer from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wsjrpc_rpc::{Connection, ConnectionId};

use crate::broker::Broker;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Outbound frames buffered per connection before sends are dropped.
const SEND_QUEUE_CAPACITY: usize = 1024;

/// Ping cadence and the silence after which a peer is dropped.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// Interval between server-initiated Ping frames.
    pub interval: Duration,
    /// How long without any inbound frame before disconnecting.
    pub timeout: Duration,
}

/// What the reader does with one inbound frame.
#[derive(Debug, PartialEq, Eq)]
enum Inbound<'a> {
    Text(&'a str),
    Close,
    Control,
    Unreadable(usize),
}

fn classify(message: &Message) -> Inbound<'_> {
    match message {
        Message::Text(text) => Inbound::Text(text.as_str()),
        // Some clients send JSON in binary frames.
        Message::Binary(data) => {
            std::str::from_utf8(data).map_or(Inbound::Unreadable(data.len()), Inbound::Text)
        }
        Message::Close(_) => Inbound::Close,
        Message::Ping(_) | Message::Pong(_) => Inbound::Control,
    }
}

/// Run a WebSocket session for a connected peer.
///
/// 1. Attaches the connection to the broker as anonymous
/// 2. Forwards queued outbound frames and sends periodic Pings
/// 3. Feeds inbound text to the broker in arrival order
/// 4. Runs the close cascade before returning
#[instrument(skip_all, fields(connection = %connection_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: ConnectionId,
    broker: Arc<Broker>,
    heartbeat: Heartbeat,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(SEND_QUEUE_CAPACITY);
    let connection = Arc::new(Connection::new(connection_id.clone(), send_tx));

    let connection_start = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    broker.on_open(Arc::clone(&connection));

    let outbound_conn = Arc::clone(&connection);
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_pong_elapsed() > heartbeat.timeout
                    {
                        warn!("peer unresponsive for {:?}, disconnecting", heartbeat.timeout);
                        break;
                    }
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = cancel.cancelled() => {
                debug!("hub shutting down, ending session");
                break;
            }
            _ = &mut outbound => {
                debug!("writer stopped, ending session");
                break;
            }
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(error)) => {
                warn!(%error, "websocket error");
                break;
            }
            None => break,
        };
        connection.mark_alive();

        match classify(&message) {
            Inbound::Text(text) => broker.on_message(&connection, text),
            Inbound::Close => {
                debug!("peer sent close frame");
                break;
            }
            Inbound::Control => {}
            Inbound::Unreadable(len) => info!(len, "received non-UTF8 binary frame"),
        }
    }

    broker.on_close(&connection_id);
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
    outbound.abort();
}
