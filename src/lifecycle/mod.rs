//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load TLS → Bind listener → Build server → EventLoop
//!
//! Running (runtime.rs):
//!     Event queue → Server::handle_event
//!     Sweep tick  → Server::sweep
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger → Server::shutdown → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: TLS first, then listener, then accept
//! - Shutdown closes connections inline; no drain period

pub mod runtime;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use runtime::EventLoop;
pub use shutdown::Shutdown;
pub use startup::{start, StartupError};
