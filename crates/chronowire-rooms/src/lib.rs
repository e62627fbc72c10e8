//! Connection Registry and Broadcast Dispatcher.
//!
//! Transport independent: anything implementing [`ConnectionHandle`] can be
//! registered. The gateway registers one [`ChannelConnection`] per WebSocket.

pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod registry;

pub use channel::{ChannelConnection, Outbound};
pub use connection::ConnectionHandle;
pub use dispatcher::{route, DeliveryReport, Dispatcher, Route, Target};
pub use error::{Result, RoomError, SendError};
pub use registry::ConnectionRegistry;
