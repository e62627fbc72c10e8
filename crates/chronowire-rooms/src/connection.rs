use async_trait::async_trait;
use serde_json::Value;

use crate::error::SendError;

/// Transport-side view of one live client session.
///
/// Implementations must be `Send + Sync`: the registry hands out shared
/// handles and the dispatcher delivers to many of them concurrently.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Unique for the lifetime of the process; never reused after disconnect.
    fn id(&self) -> &str;

    /// Deliver an event, waiting for the transport to accept it.
    ///
    /// Fails only with [`SendError::Closed`].
    async fn send(&self, event: &str, payload: &Value) -> Result<(), SendError>;

    /// Deliver an event only if the transport can take it right now.
    fn try_send(&self, event: &str, payload: &Value) -> Result<(), SendError>;

    /// Ask the transport to end the session. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the session has ended, from either side.
    async fn closed(&self);
}
