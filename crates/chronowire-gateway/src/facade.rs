use std::sync::Arc;

use axum::Router;
use chronowire_core::{ChronowireConfig, ChronowireError, DeliveryMode, Result};
use chronowire_rooms::{ConnectionHandle, ConnectionRegistry, DeliveryReport, Target};
use chronowire_scheduler::{
    open_store, Chronology, HandlerRegistry, JobEvent, JobHandler, JobRecord, JobStore,
    SchedulerEngine, SchedulerHandle,
};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    app::{build_router, AppState},
    jobs::{forward_job_events, message_handler, MessageJob, MESSAGE_JOB},
    listeners::{ClientEvent, ListenerKey},
};

const JOB_EVENT_BUFFER: usize = 256;

/// Background pieces owned between `start` and `shutdown`.
struct Lifecycle {
    engine: Option<SchedulerEngine>,
    job_events: Option<mpsc::Receiver<JobEvent>>,
    shutdown: watch::Sender<bool>,
    engine_task: Option<JoinHandle<()>>,
    router_task: Option<JoinHandle<()>>,
}

/// Host-facing entry point: schedules tasks, registers client listeners and
/// sends messages to connections and rooms.
///
/// Cheap to clone; every clone drives the same instance.
#[derive(Clone)]
pub struct Chronowire {
    state: Arc<AppState>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl Chronowire {
    /// Build an instance over the store named by `config.scheduler.store`.
    pub fn new(config: ChronowireConfig) -> Result<Self> {
        let store = open_store(&config.scheduler.store)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ChronowireConfig, store: Arc<dyn JobStore>) -> Self {
        let (events_tx, events_rx) = if config.delivery.job_events {
            let (tx, rx) = mpsc::channel(JOB_EVENT_BUFFER);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let engine = SchedulerEngine::new(
            store,
            HandlerRegistry::new(),
            config.scheduler.clone(),
            events_tx,
        );
        let state = Arc::new(AppState::new(config, engine.handle()));
        state.scheduler.register_handler(
            MESSAGE_JOB,
            message_handler(state.dispatcher.clone(), state.default_mode()),
        );

        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                engine: Some(engine),
                job_events: events_rx,
                shutdown,
                engine_task: None,
                router_task: None,
            })),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn config(&self) -> &ChronowireConfig {
        &self.state.config
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.state.scheduler
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Bind `handler` to `name`. Must be called on every start, before
    /// [`Self::start`], for each job type that may be in the store.
    pub fn register_handler<H>(&self, name: impl Into<String>, handler: H) -> bool
    where
        H: JobHandler + 'static,
    {
        self.state.scheduler.register_handler(name, handler)
    }

    /// Register `handler` under `name` and schedule one job of that type.
    pub async fn schedule_task<H>(
        &self,
        name: &str,
        when: &str,
        chronology: Chronology,
        payload: Value,
        handler: H,
    ) -> Result<JobRecord>
    where
        H: JobHandler + 'static,
    {
        self.register_handler(name, handler);
        self.schedule(name, when, chronology, payload).await
    }

    /// Schedule a job for an already registered handler.
    pub async fn schedule(
        &self,
        name: &str,
        when: &str,
        chronology: Chronology,
        payload: Value,
    ) -> Result<JobRecord> {
        Ok(self
            .state
            .scheduler
            .schedule_task(name, payload, chronology, when)
            .await?)
    }

    /// Schedule a message to be sent when the job fires. The target is
    /// checked now so an unroutable message is never persisted.
    pub async fn schedule_message(
        &self,
        when: &str,
        chronology: Chronology,
        message: MessageJob,
    ) -> Result<JobRecord> {
        message.route()?;
        let payload = serde_json::to_value(&message)?;
        self.schedule(MESSAGE_JOB, when, chronology, payload).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<()> {
        Ok(self.state.scheduler.cancel(id).await?)
    }

    pub async fn jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.state.scheduler.list_jobs().await?)
    }

    // ------------------------------------------------------------------
    // Client listeners
    // ------------------------------------------------------------------

    pub fn on_subscribe<F, Fut>(&self, callback: F)
    where
        F: Fn(ClientEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state.listeners.add(ListenerKey::Subscribe, callback);
    }

    pub fn on_unsubscribe<F, Fut>(&self, callback: F)
    where
        F: Fn(ClientEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state.listeners.add(ListenerKey::Unsubscribe, callback);
    }

    /// Called for every `message` request.
    pub fn on_message<F, Fut>(&self, callback: F)
    where
        F: Fn(ClientEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state.listeners.add(ListenerKey::Message, callback);
    }

    /// Called when a client invokes a method named `event` that the gateway
    /// does not handle itself.
    pub fn on_custom_event<F, Fut>(&self, event: impl Into<String>, callback: F)
    where
        F: Fn(ClientEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state
            .listeners
            .add(ListenerKey::Custom(event.into()), callback);
    }

    /// Remove every listener for `event`. `subscribe`, `unsubscribe` and
    /// `message` address the built-in hooks. Returns how many were removed.
    pub fn remove_listeners(&self, event: &str) -> usize {
        let key = match event {
            "subscribe" => ListenerKey::Subscribe,
            "unsubscribe" => ListenerKey::Unsubscribe,
            "message" => ListenerKey::Message,
            other => ListenerKey::Custom(other.to_string()),
        };
        self.state.listeners.remove(&key)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send `event` to `target`. `mode` falls back to `delivery.mode`.
    pub async fn send_message(
        &self,
        target: &Target,
        event: &str,
        payload: Value,
        mode: Option<DeliveryMode>,
    ) -> Result<DeliveryReport> {
        let mode = mode.unwrap_or_else(|| self.state.default_mode());
        Ok(self
            .state
            .dispatcher
            .send(target, event, &payload, mode)
            .await?)
    }

    pub fn connections(&self) -> Vec<Arc<dyn ConnectionHandle>> {
        self.state.registry.connections()
    }

    pub fn connection(&self, id: &str) -> Result<Arc<dyn ConnectionHandle>> {
        Ok(self.state.registry.get(id)?)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.state))
    }

    /// Recover interrupted jobs, then start the dispatch loop and the job
    /// event router. Returns the number of recovered jobs.
    ///
    /// Register handlers first: recovered jobs may be dispatched right away.
    pub async fn start(&self) -> Result<usize> {
        let mut lc = self.lifecycle.lock().await;
        let Some(engine) = lc.engine.take() else {
            warn!("chronowire already started");
            return Ok(0);
        };

        let recovered = match engine.recover().await {
            Ok(n) => n,
            Err(e) => {
                lc.engine = Some(engine);
                return Err(ChronowireError::from(e));
            }
        };

        let shutdown_rx = lc.shutdown.subscribe();
        lc.engine_task = Some(tokio::spawn(engine.run(shutdown_rx)));
        if let Some(rx) = lc.job_events.take() {
            let state = Arc::clone(&self.state);
            lc.router_task = Some(tokio::spawn(forward_job_events(rx, state)));
        }

        info!(recovered, "chronowire started");
        Ok(recovered)
    }

    /// Serve HTTP and WebSocket traffic until [`Self::shutdown`] is called.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.lifecycle.lock().await.shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = %self.state.config.gateway.path, "chronowire gateway listening");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
    }

    /// Stop accepting work: close every connection, stop the dispatch loop
    /// and wait for running jobs to finish.
    pub async fn shutdown(&self) {
        let mut lc = self.lifecycle.lock().await;
        lc.shutdown.send_replace(true);

        for conn in self.state.registry.connections() {
            conn.close();
        }
        if let Some(task) = lc.engine_task.take() {
            if let Err(e) = task.await {
                warn!("scheduler task ended abnormally: {e}");
            }
        }
        if let Some(task) = lc.router_task.take() {
            task.abort();
        }
        info!("chronowire stopped");
    }
}
