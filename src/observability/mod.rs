//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Server and connections produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Connection id flows through every log event
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
