use chronowire_core::ChronowireError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Values of the `type` discriminator shared by every frame.
pub const KIND_REQ: &str = "req";
pub const KIND_RES: &str = "res";
pub const KIND_EVENT: &str = "event";

fn req_kind() -> String {
    KIND_REQ.to_string()
}

fn to_payload(payload: impl Serialize) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Anything a client sends. Only the discriminator is typed up front; the
/// gateway ignores frames that are not requests.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl InboundFrame {
    /// The request carried by this frame, if it is a well-formed `req`.
    pub fn as_req(&self) -> Option<ReqFrame> {
        if self.frame_type != KIND_REQ {
            return None;
        }
        serde_json::from_value(Value::Object(self.rest.clone())).ok()
    }
}

/// A client call such as `subscribe`, `send` or `jobs.schedule_message`.
///
/// ```json
/// { "type": "req", "id": "7", "method": "send",
///   "params": { "event": "chat", "rooms": "lobby", "payload": "hi" } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqFrame {
    #[serde(rename = "type", default = "req_kind")]
    pub frame_type: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ReqFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: impl Serialize) -> Self {
        Self {
            frame_type: req_kind(),
            id: id.into(),
            method: method.into(),
            params: Some(to_payload(params)),
        }
    }
}

/// Answer to exactly one [`ReqFrame`], matched by `id`. Carries either a
/// `payload` (a delivery report, a job record, `{ "pong": true }`) or an
/// `error` with a wire code such as `MISSING_TARGET`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResFrame {
    pub fn ok(id: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            frame_type: KIND_RES.to_string(),
            id: id.into(),
            ok: true,
            payload: Some(to_payload(payload)),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: &str, message: &str) -> Self {
        Self {
            frame_type: KIND_RES.to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

impl From<(&str, &ChronowireError)> for ResFrame {
    fn from((id, e): (&str, &ChronowireError)) -> Self {
        ResFrame::err(id, e.code(), &e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

/// Server push: room traffic, `connected`, the `tick` heartbeat and
/// `job.completed` / `job.failed`. `seq` increases across the whole gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            frame_type: KIND_EVENT.to_string(),
            event: event.into(),
            payload: Some(to_payload(payload)),
            seq: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}
