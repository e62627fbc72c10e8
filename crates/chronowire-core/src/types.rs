use serde::{Deserialize, Serialize};
use std::fmt;

/// How the broadcast dispatcher treats a recipient that cannot take data right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Wait for room in the recipient's outbound queue; only a closed
    /// connection loses the message.
    #[default]
    Guaranteed,
    /// Drop the message for any recipient whose queue is full or closed.
    /// Nothing is queued or retried.
    BestEffort,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryMode::Guaranteed => "guaranteed",
            DeliveryMode::BestEffort => "best-effort",
        };
        write!(f, "{s}")
    }
}
