use axum::extract::ws::{Message, WebSocket};
use chronowire_protocol::frames::EventFrame;
use chronowire_rooms::Outbound;
use futures_util::SinkExt;

pub type WsSink = futures_util::stream::SplitSink<WebSocket, Message>;

/// Serialize any value to JSON and send it over the WS connection.
pub async fn json<T: serde::Serialize>(tx: &mut WsSink, payload: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(payload).map_err(axum::Error::new)?;
    tx.send(Message::Text(text.into())).await
}

/// Wrap a queued push as a sequenced EVENT frame.
pub fn event_frame(out: Outbound, seq: u64) -> EventFrame {
    EventFrame::new(out.event, out.payload).with_seq(seq)
}
