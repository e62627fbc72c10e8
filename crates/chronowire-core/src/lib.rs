//! Shared configuration, error codes and cross-crate enums for chronowire.

pub mod config;
pub mod error;
pub mod types;

pub use config::ChronowireConfig;
pub use error::{ChronowireError, Result};
pub use types::DeliveryMode;
