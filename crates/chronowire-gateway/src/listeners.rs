use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

/// What a listener is registered for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    Subscribe,
    Unsubscribe,
    Message,
    /// A client method the gateway does not handle itself.
    Custom(String),
}

/// Something a client did, as seen by host callbacks.
///
/// For `subscribe`/`unsubscribe` the payload is the list of rooms that
/// actually changed; for everything else it is the request params.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub conn_id: String,
    pub event: String,
    pub payload: Value,
}

type Callback = Arc<dyn Fn(ClientEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Host callbacks keyed by event. Several callbacks per key run in
/// registration order.
#[derive(Default)]
pub struct Listeners {
    callbacks: DashMap<ListenerKey, Vec<Callback>>,
}

impl Listeners {
    pub fn add<F, Fut>(&self, key: ListenerKey, callback: F)
    where
        F: Fn(ClientEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |event| Box::pin(callback(event)));
        self.callbacks.entry(key).or_default().push(callback);
    }

    /// Drop every callback for `key`. Returns how many were removed.
    pub fn remove(&self, key: &ListenerKey) -> usize {
        self.callbacks.remove(key).map(|(_, v)| v.len()).unwrap_or(0)
    }

    pub fn has(&self, key: &ListenerKey) -> bool {
        self.callbacks.get(key).is_some_and(|v| !v.is_empty())
    }

    /// Run every callback for `key`, in order. A failing callback is logged
    /// and does not stop the rest. Returns the number of callbacks run.
    pub async fn fire(&self, key: &ListenerKey, event: ClientEvent) -> usize {
        // Clone out so no map guard is held across an await.
        let callbacks: Vec<Callback> = match self.callbacks.get(key) {
            Some(v) => v.clone(),
            None => return 0,
        };
        for cb in &callbacks {
            if let Err(e) = cb(event.clone()).await {
                warn!(conn_id = %event.conn_id, event = %event.event, "listener failed: {e:#}");
            }
        }
        callbacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(name: &str) -> ClientEvent {
        ClientEvent {
            conn_id: "c1".into(),
            event: name.into(),
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn fires_all_listeners_even_after_failure() {
        let listeners = Listeners::default();
        let hits = Arc::new(AtomicUsize::new(0));
        listeners.add(ListenerKey::Custom("typing".into()), |_| async {
            Err::<(), _>(anyhow::anyhow!("first one breaks"))
        });
        let h = Arc::clone(&hits);
        listeners.add(ListenerKey::Custom("typing".into()), move |_| {
            let h = Arc::clone(&h);
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        let ran = listeners
            .fire(&ListenerKey::Custom("typing".into()), event("typing"))
            .await;
        assert_eq!(ran, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removed_listeners_do_not_fire() {
        let listeners = Listeners::default();
        listeners.add(ListenerKey::Message, |_| async { anyhow::Ok(()) });
        listeners.add(ListenerKey::Message, |_| async { anyhow::Ok(()) });
        assert!(listeners.has(&ListenerKey::Message));

        assert_eq!(listeners.remove(&ListenerKey::Message), 2);
        assert!(!listeners.has(&ListenerKey::Message));
        assert_eq!(listeners.fire(&ListenerKey::Message, event("message")).await, 0);
    }
}
