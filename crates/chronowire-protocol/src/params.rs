use chronowire_core::DeliveryMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single room name or a list of them: `"r1"` or `["r1", "r2"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

impl From<&str> for OneOrMany {
    fn from(s: &str) -> Self {
        OneOrMany::One(s.to_string())
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(v: Vec<String>) -> Self {
        OneOrMany::Many(v)
    }
}

/// Params of `subscribe` / `unsubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsParams {
    pub rooms: OneOrMany,
}

/// Who a client-originated message goes to.
///
/// | `to` | `rooms` | `broadcast` | recipients                  |
/// |------|---------|-------------|-----------------------------|
/// | set  | -       | -           | that one connection         |
/// | -    | set     | true        | every member of the rooms   |
/// | -    | set     | false       | members except the sender   |
/// | -    | -       | true        | every connection            |
/// | -    | -       | false       | rejected (missing target)   |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Addressing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<OneOrMany>,
    #[serde(default = "bool_true")]
    pub broadcast: bool,
}

impl Default for Addressing {
    fn default() -> Self {
        Self {
            to: None,
            rooms: None,
            broadcast: true,
        }
    }
}

/// Params of `send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendParams {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(flatten)]
    pub address: Addressing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeliveryMode>,
}

/// Params of `jobs.schedule_message`.
///
/// `when` is an RFC 3339 timestamp, a human interval ("5 minutes") or, for
/// recurring jobs, a cron expression. `chronology` is `one_shot` (default)
/// or `recurring`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleMessageParams {
    pub when: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chronology: Option<String>,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(flatten)]
    pub address: Addressing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeliveryMode>,
}

/// Params of `jobs.cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: String,
}

fn bool_true() -> bool {
    true
}
