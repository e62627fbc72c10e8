use std::sync::Arc;

use chronowire_core::DeliveryMode;
use chronowire_protocol::{
    methods::{EVENT_JOB_COMPLETED, EVENT_JOB_FAILED},
    params::{Addressing, OneOrMany},
};
use chronowire_rooms::{route, Dispatcher, Route, RoomError, Target};
use chronowire_scheduler::{JobContext, JobEvent, JobHandler, JobOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;

/// Type name of the built-in job that sends a message when it fires.
pub const MESSAGE_JOB: &str = "chronowire.message";

/// Payload of a [`MESSAGE_JOB`] record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageJob {
    pub target: Addressing,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeliveryMode>,
}

impl MessageJob {
    /// Recipients of this message. A scheduled message has no sender, so the
    /// except-sender flag is ignored.
    pub fn route(&self) -> Result<Route, RoomError> {
        let rooms = self
            .target
            .rooms
            .clone()
            .map(OneOrMany::into_vec)
            .unwrap_or_default();
        route(self.target.to.clone(), rooms, self.target.broadcast)
    }
}

/// Handler for [`MESSAGE_JOB`]: deliver the stored event through `dispatcher`.
pub fn message_handler(dispatcher: Dispatcher, default_mode: DeliveryMode) -> impl JobHandler {
    move |ctx: JobContext| {
        let dispatcher = dispatcher.clone();
        async move {
            let job: MessageJob = serde_json::from_value(ctx.payload)?;
            let route = job.route()?;
            let mode = job.mode.unwrap_or(default_mode);
            let report = dispatcher
                .send(&route.target, &job.event, &job.payload, mode)
                .await?;
            debug!(
                job_id = %ctx.job_id,
                event = %job.event,
                delivered = report.delivered,
                "scheduled message sent"
            );
            anyhow::Ok(())
        }
    }
}

/// Room that receives the completion/failure events of one job.
pub fn job_room(reference: &str) -> String {
    format!("job:{reference}")
}

/// Broadcast every [`JobEvent`] to the job's reference room until the
/// scheduler drops its sender.
pub async fn forward_job_events(mut rx: mpsc::Receiver<JobEvent>, state: Arc<AppState>) {
    info!("job event router started");
    while let Some(event) = rx.recv().await {
        let name = match event.outcome {
            JobOutcome::Completed => EVENT_JOB_COMPLETED,
            JobOutcome::Failed { .. } => EVENT_JOB_FAILED,
        };
        let payload = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                warn!(job_id = %event.job_id, "could not encode job event: {e}");
                continue;
            }
        };
        let room = job_room(&event.reference);
        match state
            .dispatcher
            .send(&Target::Room(room.clone()), name, &payload, state.default_mode())
            .await
        {
            Ok(report) if report.resolved > 0 => {
                debug!(job_id = %event.job_id, %room, delivered = report.delivered, "job event forwarded");
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %event.job_id, %room, "job event not forwarded: {e}"),
        }
    }
    info!("job event router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_job_wire_shape() {
        let job: MessageJob = serde_json::from_value(json!({
            "target": { "rooms": "r1" },
            "event": "chat",
            "payload": "hello"
        }))
        .unwrap();
        assert!(job.target.broadcast);
        let route = job.route().unwrap();
        assert_eq!(route.target, Target::Room("r1".into()));
    }

    #[test]
    fn non_broadcast_without_room_is_rejected() {
        let job: MessageJob = serde_json::from_value(json!({
            "target": { "broadcast": false },
            "event": "chat"
        }))
        .unwrap();
        assert!(matches!(job.route(), Err(RoomError::MissingTarget(_))));
    }

    #[test]
    fn job_rooms_are_namespaced() {
        assert_eq!(job_room("abc123"), "job:abc123");
    }
}
