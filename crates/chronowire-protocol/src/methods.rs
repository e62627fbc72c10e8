// Well-known WS method names. Anything not listed here is routed to the
// host's custom event listeners.

// utility
pub const PING: &str = "ping";

// rooms
pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";

// messaging
pub const MESSAGE: &str = "message";
pub const SEND: &str = "send";

// scheduler
pub const JOBS_LIST: &str = "jobs.list";
pub const JOBS_CANCEL: &str = "jobs.cancel";
pub const JOBS_SCHEDULE_MESSAGE: &str = "jobs.schedule_message";

// server → client events
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_TICK: &str = "tick";
pub const EVENT_JOB_COMPLETED: &str = "job.completed";
pub const EVENT_JOB_FAILED: &str = "job.failed";

/// True for method names the gateway handles itself.
pub fn is_builtin(method: &str) -> bool {
    matches!(
        method,
        PING | SUBSCRIBE | UNSUBSCRIBE | MESSAGE | SEND | JOBS_LIST | JOBS_CANCEL
            | JOBS_SCHEDULE_MESSAGE
    )
}
