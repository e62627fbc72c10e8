use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionHandle, error::SendError};

/// One queued server push.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub event: String,
    pub payload: Value,
}

/// [`ConnectionHandle`] backed by a bounded mpsc queue.
///
/// The transport task owns the receiving half and writes whatever arrives to
/// the wire; it watches [`ChannelConnection::cancel_token`] to learn that the
/// server closed the session.
pub struct ChannelConnection {
    id: String,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ChannelConnection {
    pub fn new(id: impl Into<String>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: id.into(),
            tx,
            cancel: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn frame(event: &str, payload: &Value) -> Outbound {
        Outbound {
            event: event.to_string(),
            payload: payload.clone(),
        }
    }
}

#[async_trait]
impl ConnectionHandle for ChannelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: &str, payload: &Value) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        tokio::select! {
            sent = self.tx.send(Self::frame(event, payload)) => sent.map_err(|_| SendError::Closed),
            _ = self.cancel.cancelled() => Err(SendError::Closed),
        }
    }

    fn try_send(&self, event: &str, payload: &Value) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx
            .try_send(Self::frame(event, payload))
            .map_err(|e| match e {
                TrySendError::Full(_) => SendError::Full,
                TrySendError::Closed(_) => SendError::Closed,
            })
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn try_send_reports_full_queue() {
        let (conn, mut rx) = ChannelConnection::new("c1", 1);
        conn.try_send("a", &json!(1)).unwrap();
        assert_eq!(conn.try_send("b", &json!(2)), Err(SendError::Full));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, "a");
        conn.try_send("c", &json!(3)).unwrap();
    }

    #[tokio::test]
    async fn close_rejects_further_sends() {
        let (conn, _rx) = ChannelConnection::new("c1", 4);
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.send("a", &json!(null)).await, Err(SendError::Closed));
        assert_eq!(conn.try_send("a", &json!(null)), Err(SendError::Closed));
        conn.closed().await;
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_closed() {
        let (conn, rx) = ChannelConnection::new("c1", 4);
        drop(rx);
        assert!(conn.is_closed());
        assert_eq!(conn.send("a", &json!(null)).await, Err(SendError::Closed));
        conn.closed().await;
    }

    #[tokio::test]
    async fn close_wakes_a_send_waiting_on_a_full_queue() {
        let (conn, _rx) = ChannelConnection::new("c1", 1);
        conn.try_send("a", &json!(1)).unwrap();

        let waiter = Arc::clone(&conn);
        let pending = tokio::spawn(async move { waiter.send("b", &json!(2)).await });
        tokio::task::yield_now().await;
        conn.close();
        assert_eq!(pending.await.unwrap(), Err(SendError::Closed));
    }
}
