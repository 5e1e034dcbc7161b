//! TLS-terminating connection engine for remote-desktop style listeners.

// Core subsystems
pub mod buffer;
pub mod error;
pub mod event;
pub mod net;
pub mod server;

// Protocol glue
pub mod framing;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::GatewayConfig;
pub use error::NetError;
pub use event::{event_channel, Event, EventSink};
pub use lifecycle::{EventLoop, Shutdown};
pub use server::{Connection, ConnectionId, Delegate, DeliveryGuard, Server, ServerHandle};
