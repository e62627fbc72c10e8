//! Chronowire gateway: the host-facing facade plus the WebSocket transport.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use chronowire_gateway::Chronowire;
//! use chronowire_scheduler::{Chronology, JobContext};
//!
//! let cw = Chronowire::new(Default::default())?;
//! cw.schedule_task("remind", "in 5 minutes", Chronology::OneShot, serde_json::json!({}),
//!     |ctx: JobContext| async move {
//!         tracing::info!(payload = %ctx.payload, "reminder");
//!         anyhow::Ok(())
//!     }).await?;
//! cw.start().await?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:18790").await?;
//! cw.serve(listener).await?;
//! # Ok(()) }
//! ```

pub mod app;
pub mod facade;
pub mod http;
pub mod jobs;
pub mod listeners;
pub mod ws;

pub use facade::Chronowire;
pub use listeners::ClientEvent;

pub use chronowire_core::{ChronowireConfig, ChronowireError, DeliveryMode};
pub use chronowire_rooms::{DeliveryReport, Target};
