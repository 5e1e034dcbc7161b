//! Per-connection byte buffers.
//!
//! # Data Flow
//! ```text
//! transport read  → read_buffer.rs (grow on demand, deliver, consume prefix)
//! Connection::send → byte_queue.rs (bounded FIFO) → transport write
//! ```
//!
//! # Design Decisions
//! - Both buffers are owned by exactly one connection; no locking
//! - Appends are all-or-nothing so the queue never holds a torn write
//! - Read-buffer growth is bounded; hitting the ceiling ends the connection

pub mod byte_queue;
pub mod read_buffer;

pub use byte_queue::ByteQueue;
pub use read_buffer::{ReadBuffer, ReadBufferLimits};
