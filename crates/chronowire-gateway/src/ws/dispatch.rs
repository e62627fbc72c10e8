use std::sync::Arc;

use chronowire_protocol::{frames::ResFrame, methods};

use crate::app::AppState;
use crate::ws::handlers;

/// Route a WS method call to its handler. Unknown methods go to the host's
/// custom event listeners.
pub async fn route(
    conn_id: &str,
    method: &str,
    params: Option<&serde_json::Value>,
    req_id: &str,
    app: &Arc<AppState>,
) -> ResFrame {
    let result = match method {
        methods::PING => Ok(serde_json::json!({ "pong": true })),

        // rooms
        methods::SUBSCRIBE => handlers::handle_subscribe(conn_id, params, app).await,
        methods::UNSUBSCRIBE => handlers::handle_unsubscribe(conn_id, params, app).await,

        // messaging
        methods::MESSAGE => handlers::handle_message(conn_id, params, app).await,
        methods::SEND => handlers::handle_send(conn_id, params, app).await,

        // scheduler
        methods::JOBS_LIST => handlers::handle_jobs_list(app).await,
        methods::JOBS_CANCEL => handlers::handle_jobs_cancel(params, app).await,
        methods::JOBS_SCHEDULE_MESSAGE => handlers::handle_schedule_message(params, app).await,

        other => handlers::handle_custom(conn_id, other, params, app).await,
    };

    match result {
        Ok(payload) => ResFrame::ok(req_id, payload),
        Err(e) => ResFrame::from((req_id, &e)),
    }
}
