//! Concrete WS method handler functions.
//!
//! Each function extracts its parameters, calls into [`AppState`], and
//! returns the RES payload. `dispatch::route` is the only caller and turns
//! errors into `ResFrame::err` with the error's wire code.

use chronowire_core::{ChronowireError, Result};
use chronowire_protocol::params::{
    CancelParams, OneOrMany, RoomsParams, ScheduleMessageParams, SendParams,
};
use chronowire_rooms::route;
use chronowire_scheduler::Chronology;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;
use crate::jobs::{MessageJob, MESSAGE_JOB};
use crate::listeners::{ClientEvent, ListenerKey};

fn parse<T: DeserializeOwned>(params: Option<&Value>) -> Result<T> {
    let value = params.cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| ChronowireError::InvalidParams(e.to_string()))
}

fn client_event(conn_id: &str, event: &str, payload: Value) -> ClientEvent {
    ClientEvent {
        conn_id: conn_id.to_string(),
        event: event.to_string(),
        payload,
    }
}

// ---------------------------------------------------------------------------
// subscribe / unsubscribe
// ---------------------------------------------------------------------------

/// Params: `{ "rooms": string | [string] }`
///
/// Returns the rooms actually joined and the full membership afterwards.
/// Subscribe listeners only fire when at least one room was new.
pub async fn handle_subscribe(conn_id: &str, params: Option<&Value>, app: &AppState) -> Result<Value> {
    let p: RoomsParams = parse(params)?;
    let joined = app.registry.subscribe(conn_id, p.rooms.into_vec())?;
    if !joined.is_empty() {
        info!(conn_id, rooms = ?joined, "client subscribed");
        app.listeners
            .fire(
                &ListenerKey::Subscribe,
                client_event(conn_id, "subscribe", json!(joined)),
            )
            .await;
    }
    Ok(json!({ "joined": joined, "rooms": app.registry.rooms_of(conn_id)? }))
}

/// Params: `{ "rooms": string | [string] }`
pub async fn handle_unsubscribe(
    conn_id: &str,
    params: Option<&Value>,
    app: &AppState,
) -> Result<Value> {
    let p: RoomsParams = parse(params)?;
    let left = app.registry.unsubscribe(conn_id, p.rooms.into_vec())?;
    if !left.is_empty() {
        info!(conn_id, rooms = ?left, "client unsubscribed");
        app.listeners
            .fire(
                &ListenerKey::Unsubscribe,
                client_event(conn_id, "unsubscribe", json!(left)),
            )
            .await;
    }
    Ok(json!({ "left": left, "rooms": app.registry.rooms_of(conn_id)? }))
}

// ---------------------------------------------------------------------------
// message / send
// ---------------------------------------------------------------------------

/// Params: any JSON. Handed to `on_message` listeners as-is.
pub async fn handle_message(conn_id: &str, params: Option<&Value>, app: &AppState) -> Result<Value> {
    let payload = params.cloned().unwrap_or(Value::Null);
    let handled = app
        .listeners
        .fire(&ListenerKey::Message, client_event(conn_id, "message", payload))
        .await;
    Ok(json!({ "handled": handled }))
}

/// Params: `{ "event", "payload"?, "to"?, "rooms"?, "broadcast"?, "mode"? }`
///
/// Returns the delivery report.
pub async fn handle_send(conn_id: &str, params: Option<&Value>, app: &AppState) -> Result<Value> {
    let p: SendParams = parse(params)?;
    let rooms = p.address.rooms.map(OneOrMany::into_vec).unwrap_or_default();
    let route = route(p.address.to, rooms, p.address.broadcast)?;
    let except = route.exclude_sender.then_some(conn_id);
    let mode = p.mode.unwrap_or_else(|| app.default_mode());

    let report = app
        .dispatcher
        .send_except(&route.target, except, &p.event, &p.payload, mode)
        .await?;
    Ok(serde_json::to_value(report)?)
}

// ---------------------------------------------------------------------------
// jobs.*
// ---------------------------------------------------------------------------

pub async fn handle_jobs_list(app: &AppState) -> Result<Value> {
    let jobs = app.scheduler.list_jobs().await?;
    Ok(json!({ "jobs": jobs }))
}

/// Params: `{ "id": string }`
pub async fn handle_jobs_cancel(params: Option<&Value>, app: &AppState) -> Result<Value> {
    let p: CancelParams = parse(params)?;
    app.scheduler.cancel(&p.id).await?;
    Ok(json!({ "canceled": p.id }))
}

/// Params: `{ "when", "chronology"?, "event", "payload"?, "to"?, "rooms"?,
/// "broadcast"?, "mode"? }`
///
/// Returns the created job record; its `reference` names the `job:<reference>`
/// room that receives completion events.
pub async fn handle_schedule_message(params: Option<&Value>, app: &AppState) -> Result<Value> {
    let p: ScheduleMessageParams = parse(params)?;
    let chronology = match p.chronology.as_deref() {
        None => Chronology::OneShot,
        Some(s) => s.parse().map_err(ChronowireError::InvalidParams)?,
    };

    let message = MessageJob {
        target: p.address,
        event: p.event,
        payload: p.payload,
        mode: p.mode,
    };
    message.route()?;

    let job = app
        .scheduler
        .schedule_task(MESSAGE_JOB, serde_json::to_value(&message)?, chronology, &p.when)
        .await?;
    Ok(serde_json::to_value(job)?)
}

// ---------------------------------------------------------------------------
// custom events
// ---------------------------------------------------------------------------

/// Any method the gateway does not know. Fails with `METHOD_NOT_FOUND` when
/// the host registered no listener for it.
pub async fn handle_custom(
    conn_id: &str,
    method: &str,
    params: Option<&Value>,
    app: &AppState,
) -> Result<Value> {
    let key = ListenerKey::Custom(method.to_string());
    if !app.listeners.has(&key) {
        return Err(ChronowireError::MethodNotFound {
            method: method.to_string(),
        });
    }
    let payload = params.cloned().unwrap_or(Value::Null);
    let handled = app
        .listeners
        .fire(&key, client_event(conn_id, method, payload))
        .await;
    Ok(json!({ "handled": handled }))
}
