use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use chronowire_core::{
    config::{HEARTBEAT_INTERVAL_SECS, MAX_PAYLOAD_BYTES},
    ChronowireError,
};
use chronowire_protocol::{
    frames::{EventFrame, ResFrame},
    methods::{EVENT_CONNECTED, EVENT_TICK},
};
use chronowire_rooms::{ChannelConnection, ConnectionRegistry, Outbound};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::ws::{message, send};

/// Messages between the cap and this limit get a `PAYLOAD_TOO_LARGE` reply;
/// larger ones are cut off by the codec before they are buffered.
const CODEC_LIMIT: usize = MAX_PAYLOAD_BYTES * 2;

/// Axum handler: upgrades HTTP to WebSocket on the configured path.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(CODEC_LIMIT)
        .max_frame_size(CODEC_LIMIT)
        .on_upgrade(|socket| run_connection(socket, state))
}

/// Keeps a connection registered for as long as its session task lives.
/// Dropping it (normal exit or unwind) removes the id from every room and
/// stops the writer.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    conn_id: String,
    cancel: CancellationToken,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.conn_id);
        self.cancel.cancel();
    }
}

/// Per-connection session. The current task reads requests; a second task
/// owns the socket sink and writes responses, queued events and heartbeats,
/// so a request that sends to its own connection never waits on itself.
async fn run_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let buffer = state.config.delivery.outbound_buffer;

    let (conn, outbound_rx) = ChannelConnection::new(conn_id.clone(), buffer);
    let cancel = conn.cancel_token();
    state.registry.register(conn);
    let registration = Registration {
        registry: Arc::clone(&state.registry),
        conn_id: conn_id.clone(),
        cancel: cancel.clone(),
    };
    info!(conn_id = %conn_id, "new WS connection");

    let (tx, mut rx) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel::<ResFrame>(buffer.max(1));

    let writer = tokio::spawn(write_loop(
        conn_id.clone(),
        tx,
        outbound_rx,
        reply_rx,
        cancel.clone(),
        Arc::clone(&state),
    ));

    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id, size = text.len(), "payload too large");
                            let e = ChronowireError::PayloadTooLarge {
                                size: text.len(),
                                max: MAX_PAYLOAD_BYTES,
                            };
                            let _ = reply_tx.send(ResFrame::from(("", &e))).await;
                            break;
                        }
                        if let Some(res) = message::handle(&conn_id, &text, &state).await {
                            if reply_tx.send(res).await.is_err() {
                                break;
                            }
                        }
                    }
                    // axum answers pings itself.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id, error = %e, "WS read error");
                        break;
                    }
                    _ => {}
                }
            }

            _ = cancel.cancelled() => break,
        }
    }

    // Replies already queued are flushed before the writer sees the cancel.
    drop(reply_tx);
    drop(registration);
    let _ = writer.await;
    info!(conn_id, "WS connection closed");
}

async fn write_loop(
    conn_id: String,
    mut tx: send::WsSink,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut reply_rx: mpsc::Receiver<ResFrame>,
    cancel: CancellationToken,
    state: Arc<AppState>,
) {
    let hello = EventFrame::new(EVENT_CONNECTED, serde_json::json!({ "conn_id": conn_id }))
        .with_seq(state.next_seq());
    if send::json(&mut tx, &hello).await.is_err() {
        cancel.cancel();
        return;
    }

    let period = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let sent = tokio::select! {
            biased;

            res = reply_rx.recv() => match res {
                Some(res) => send::json(&mut tx, &res).await,
                None => break,
            },

            out = outbound_rx.recv() => match out {
                Some(out) => {
                    let frame = send::event_frame(out, state.next_seq());
                    send::json(&mut tx, &frame).await
                }
                None => break,
            },

            _ = tick.tick() => {
                let ev = EventFrame::new(
                    EVENT_TICK,
                    serde_json::json!({ "ts": chrono::Utc::now().timestamp_millis() }),
                )
                .with_seq(state.next_seq());
                send::json(&mut tx, &ev).await
            }

            _ = cancel.cancelled() => break,
        };

        if let Err(e) = sent {
            debug!(conn_id, error = %e, "WS write failed");
            break;
        }
    }

    cancel.cancel();
    let _ = tx.send(Message::Close(None)).await;
}
