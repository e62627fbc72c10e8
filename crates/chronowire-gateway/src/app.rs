use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{routing::get, Router};
use chronowire_core::{ChronowireConfig, DeliveryMode};
use chronowire_rooms::{ConnectionRegistry, Dispatcher};
use chronowire_scheduler::SchedulerHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::listeners::Listeners;

/// Shared state behind every Axum handler and the facade.
pub struct AppState {
    pub config: ChronowireConfig,
    pub event_seq: AtomicU64,
    /// Live connections and room memberships.
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Dispatcher,
    pub listeners: Listeners,
    pub scheduler: SchedulerHandle,
}

impl AppState {
    pub fn new(config: ChronowireConfig, scheduler: SchedulerHandle) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry))
            .with_send_timeout(Duration::from_millis(config.delivery.send_timeout_ms));
        Self {
            config,
            event_seq: AtomicU64::new(0),
            dispatcher,
            registry,
            listeners: Listeners::default(),
            scheduler,
        }
    }

    /// Monotonically increasing sequence for server-pushed events.
    pub fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Mode used when a send does not name one.
    pub fn default_mode(&self) -> DeliveryMode {
        self.config.delivery.mode
    }
}

/// Assemble the Axum router: health probe plus the WS upgrade on the
/// configured socket path.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.gateway.allowed_origins);
    let ws_path = normalize_path(&state.config.gateway.path);

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(&ws_path, get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new().allow_origin(AllowOrigin::any());
    }
    let allowed: Vec<_> = origins
        .iter()
        .filter_map(|o| match o.parse::<axum::http::HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring malformed allowed origin");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(allowed))
}
