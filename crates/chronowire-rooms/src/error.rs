use chronowire_core::ChronowireError;
use thiserror::Error;

/// Addressing and membership errors. Never fatal to the registry.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The id does not belong to a live connection.
    #[error("Connection not found: {id}")]
    ConnectionNotFound { id: String },

    /// A send could not be resolved to any recipient set.
    #[error("Message has no target: {0}")]
    MissingTarget(String),

    #[error("Invalid room name: {0:?}")]
    InvalidRoom(String),
}

/// Why a single delivery attempt did not reach a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Outbound queue is full (only reported by non-blocking sends).
    #[error("outbound queue full")]
    Full,
    /// The connection has gone away.
    #[error("connection closed")]
    Closed,
    /// A blocking send waited past the dispatcher's deadline.
    #[error("send timed out")]
    TimedOut,
}

impl From<RoomError> for ChronowireError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::ConnectionNotFound { id } => ChronowireError::ConnectionNotFound { id },
            RoomError::MissingTarget(msg) => ChronowireError::MissingTarget(msg),
            RoomError::InvalidRoom(room) => {
                ChronowireError::InvalidParams(format!("invalid room name: {room:?}"))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, RoomError>;
