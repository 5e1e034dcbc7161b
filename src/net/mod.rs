//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept on a background task)
//!     → tcp.rs (per-socket I/O task, completion notifications)
//!     → tls.rs (rustls upgrade after the handshake response)
//!     → Hand off to the connection engine
//! ```
//!
//! # Design Decisions
//! - The engine only sees the traits in io.rs, so tests drive it with
//!   scripted transports and no runtime
//! - TLS is applied in place: the raw transport is consumed by the wrap

pub mod io;
pub mod listener;
pub mod tcp;
pub mod tls;

pub use io::{AcceptNotifier, IoStatus, Listener, Notifier, TlsContext, TlsTransport, Transport};
pub use listener::{ListenerError, TcpAcceptor};
pub use tcp::{TcpTransport, TlsTcpTransport};
pub use tls::RustlsContext;
