use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::{
    error::{Result, SchedulerError},
    types::JobContext,
};

/// Executable logic for one job type.
///
/// Any `Fn(JobContext) -> impl Future<Output = anyhow::Result<()>>` closure
/// is a handler, so most callers never implement this trait by hand.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Maps job type names to handlers.
///
/// Purely in-memory and rebuilt on every start: a job record only stores its
/// `type_name`, so the host must re-register each name before recovered jobs
/// are dispatched. Registering an existing name replaces the old handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` under `type_name`. Returns `true` if a previous
    /// registration was replaced.
    pub fn register<H>(&self, type_name: impl Into<String>, handler: H) -> bool
    where
        H: JobHandler + 'static,
    {
        self.register_arc(type_name, Arc::new(handler))
    }

    pub fn register_arc(&self, type_name: impl Into<String>, handler: Arc<dyn JobHandler>) -> bool {
        let type_name = type_name.into();
        let replaced = self.handlers.insert(type_name.clone(), handler).is_some();
        info!(%type_name, replaced, "job handler registered");
        replaced
    }

    pub fn resolve(&self, type_name: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(type_name)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| SchedulerError::HandlerNotFound {
                type_name: type_name.to_string(),
            })
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chronology, JobRecord, Schedule};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> JobContext {
        let job = JobRecord::new(
            "greet",
            serde_json::json!({"msg": "hi"}),
            Chronology::OneShot,
            Schedule::Once { at: Utc::now() },
            Utc::now(),
        );
        JobContext::from(&job)
    }

    struct Fails;

    #[async_trait]
    impl JobHandler for Fails {
        async fn run(&self, _ctx: JobContext) -> anyhow::Result<()> {
            anyhow::bail!("always fails")
        }
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.register("greet", move |ctx: JobContext| {
            let h = Arc::clone(&h);
            async move {
                assert_eq!(ctx.payload["msg"], "hi");
                h.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        registry.resolve("greet").unwrap().run(ctx()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = HandlerRegistry::new();
        assert!(!registry.register("greet", |_ctx: JobContext| async { anyhow::Ok(()) }));
        assert!(registry.register("greet", Fails));

        let result = registry.resolve("greet").unwrap().run(ctx()).await;
        assert!(result.is_err());
        assert_eq!(registry.names(), vec!["greet".to_string()]);
    }

    #[test]
    fn unknown_type_is_not_found() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.resolve("ghost"),
            Err(SchedulerError::HandlerNotFound { .. })
        ));
        assert!(!registry.contains("ghost"));
    }
}
