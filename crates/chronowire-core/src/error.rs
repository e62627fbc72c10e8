use thiserror::Error;

/// Errors surfaced by the gateway and facade to clients and the host application.
#[derive(Debug, Error)]
pub enum ChronowireError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Job {id} cannot be canceled while {state}")]
    NotCancelable { id: String, state: String },

    #[error("Message has no target: {0}")]
    MissingTarget(String),

    #[error("Connection not found: {id}")]
    ConnectionNotFound { id: String },

    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A client frame over the per-message cap.
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChronowireError {
    /// Short error code string sent to clients in WS RES frames.
    pub fn code(&self) -> &'static str {
        match self {
            ChronowireError::Config(_) => "CONFIG_ERROR",
            ChronowireError::InvalidParams(_) => "INVALID_PARAMS",
            ChronowireError::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            ChronowireError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            ChronowireError::JobNotFound { .. } => "NOT_FOUND",
            ChronowireError::NotCancelable { .. } => "NOT_CANCELABLE",
            ChronowireError::MissingTarget(_) => "MISSING_TARGET",
            ChronowireError::ConnectionNotFound { .. } => "CONNECTION_NOT_FOUND",
            ChronowireError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ChronowireError::Serialization(_) => "SERIALIZATION_ERROR",
            ChronowireError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ChronowireError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChronowireError>;
