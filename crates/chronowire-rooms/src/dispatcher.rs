use std::sync::Arc;
use std::time::Duration;

use chronowire_core::{config::DEFAULT_SEND_TIMEOUT_MS, DeliveryMode};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    connection::ConnectionHandle,
    error::{Result, RoomError, SendError},
    registry::ConnectionRegistry,
};

/// Logical recipient set of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Connection(String),
    Room(String),
    Rooms(Vec<String>),
    /// Every registered connection.
    Global,
}

/// A resolved client-side address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: Target,
    /// Leave the sending connection out of the recipient set.
    pub exclude_sender: bool,
}

/// Turn the `to` / `rooms` / `broadcast` triple of a send into a [`Route`].
///
/// `to` wins over everything else. Rooms with `broadcast` reach every member;
/// without it they reach every member except the sender. No rooms and no
/// `broadcast` is rejected: point-to-point delivery must name a connection.
pub fn route(to: Option<String>, rooms: Vec<String>, broadcast: bool) -> Result<Route> {
    if let Some(id) = to {
        return Ok(Route {
            target: Target::Connection(id),
            exclude_sender: false,
        });
    }
    let target = match rooms.len() {
        0 if broadcast => Target::Global,
        0 => {
            return Err(RoomError::MissingTarget(
                "non-broadcast send needs a room or a connection id".to_string(),
            ))
        }
        1 => Target::Room(rooms.into_iter().next().unwrap_or_default()),
        _ => Target::Rooms(rooms),
    };
    Ok(Route {
        target,
        exclude_sender: !broadcast,
    })
}

/// Outcome counts of one send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Connections the target expanded to.
    pub resolved: usize,
    pub delivered: usize,
    /// Best-effort recipients whose queue was full.
    pub skipped: usize,
    /// Recipients that had disconnected, or stalled past the send timeout
    /// and were closed.
    pub failed: usize,
}

/// Expands targets through the registry and fans the event out.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    /// Upper bound on one guaranteed send waiting for queue room.
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Concrete recipients of `target`, minus `except` if given.
    pub fn resolve(
        &self,
        target: &Target,
        except: Option<&str>,
    ) -> Result<Vec<Arc<dyn ConnectionHandle>>> {
        let mut handles = match target {
            Target::Connection(id) => vec![self.registry.get(id)?],
            Target::Room(room) => self.registry.handles_in([room.as_str()]),
            Target::Rooms(rooms) if rooms.is_empty() => {
                return Err(RoomError::MissingTarget("empty room list".to_string()))
            }
            Target::Rooms(rooms) => self.registry.handles_in(rooms.iter().map(String::as_str)),
            Target::Global => self.registry.connections(),
        };
        if let Some(except) = except {
            handles.retain(|h| h.id() != except);
        }
        Ok(handles)
    }

    pub async fn send(
        &self,
        target: &Target,
        event: &str,
        payload: &Value,
        mode: DeliveryMode,
    ) -> Result<DeliveryReport> {
        self.send_except(target, None, event, payload, mode).await
    }

    /// Deliver to every recipient of `target` other than `except`.
    ///
    /// A recipient that fails never stops delivery to the rest. Guaranteed
    /// sends wait for queue room concurrently, each for at most the send
    /// timeout; a connection that is still full by then is closed. Best-effort
    /// sends skip any connection that cannot take the event immediately.
    pub async fn send_except(
        &self,
        target: &Target,
        except: Option<&str>,
        event: &str,
        payload: &Value,
        mode: DeliveryMode,
    ) -> Result<DeliveryReport> {
        let recipients = self.resolve(target, except)?;
        let mut report = DeliveryReport {
            resolved: recipients.len(),
            ..Default::default()
        };

        let results: Vec<(String, std::result::Result<(), SendError>)> = match mode {
            DeliveryMode::Guaranteed => {
                let limit = self.send_timeout;
                join_all(recipients.iter().map(|h| async move {
                    let result = tokio::time::timeout(limit, h.send(event, payload))
                        .await
                        .unwrap_or_else(|_| {
                            h.close();
                            Err(SendError::TimedOut)
                        });
                    (h.id().to_string(), result)
                }))
                .await
            }
            DeliveryMode::BestEffort => recipients
                .iter()
                .map(|h| (h.id().to_string(), h.try_send(event, payload)))
                .collect(),
        };

        for (conn_id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(SendError::Full) => {
                    debug!(%conn_id, event, "best-effort delivery skipped");
                    report.skipped += 1;
                }
                Err(SendError::Closed) => {
                    warn!(%conn_id, event, "delivery to closed connection");
                    report.failed += 1;
                }
                Err(SendError::TimedOut) => {
                    warn!(%conn_id, event, "recipient stalled; connection closed");
                    report.failed += 1;
                }
            }
        }

        debug!(event, %mode, ?target, ?report, "event dispatched");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table() {
        let r = route(Some("c1".into()), vec!["r1".into()], false).unwrap();
        assert_eq!(r.target, Target::Connection("c1".into()));
        assert!(!r.exclude_sender);

        let r = route(None, vec!["r1".into()], true).unwrap();
        assert_eq!(r.target, Target::Room("r1".into()));
        assert!(!r.exclude_sender);

        let r = route(None, vec!["r1".into(), "r2".into()], false).unwrap();
        assert_eq!(r.target, Target::Rooms(vec!["r1".into(), "r2".into()]));
        assert!(r.exclude_sender);

        let r = route(None, vec![], true).unwrap();
        assert_eq!(r.target, Target::Global);

        assert!(matches!(
            route(None, vec![], false),
            Err(RoomError::MissingTarget(_))
        ));
    }
}
