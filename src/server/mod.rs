//! Connection engine.
//!
//! # Data Flow
//! ```text
//! Listener accept
//!     → engine.rs (admission control, id assignment)
//!     → connection.rs (handshake request → response → TLS → messages)
//!     → delegate.rs (embedder sees connect / message / close)
//!
//! Transport completions → Event::Io → engine.rs dispatch → connection.rs
//! ```
//!
//! # Design Decisions
//! - One owner task mutates everything; other threads post events
//! - Every way a connection can end goes through one close path, which
//!   notifies the delegate exactly once
//! - Closed connections are released on a later event, never inside the
//!   callback that closed them

pub mod connection;
pub mod delegate;
pub mod engine;
pub mod registry;

pub use connection::{Connection, ConnectionSettings, State, DEFAULT_MAX_WRITE_BUFFER_BYTES};
pub use delegate::{Delegate, DeliveryGuard};
pub use engine::{Server, ServerHandle, ServerSettings};
pub use registry::{ConnectionId, ConnectionStatus, SessionRegistry};
