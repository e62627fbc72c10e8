use std::sync::Arc;

use chronowire_protocol::frames::{InboundFrame, ResFrame};
use tracing::{debug, warn};

use crate::app::AppState;
use crate::ws::dispatch;

/// Process one inbound WS text frame. Returns the response to send back, if
/// the frame was a request.
pub async fn handle(conn_id: &str, text: &str, app: &Arc<AppState>) -> Option<ResFrame> {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(conn_id, error = %e, "malformed frame");
            return None;
        }
    };

    let Some(req) = frame.as_req() else {
        debug!(conn_id, frame_type = %frame.frame_type, "ignoring non-request frame");
        return None;
    };

    debug!(conn_id, method = %req.method, req_id = %req.id, "request");
    Some(dispatch::route(conn_id, &req.method, req.params.as_ref(), &req.id, app).await)
}
