//! Error vocabulary shared by transports, buffers and the connection state machine.
//!
//! "Pending" is deliberately absent here: an operation that has not finished
//! yet is reported through [`IoStatus::Pending`](crate::net::IoStatus), not as
//! an error.

use std::io;

/// Errors that end a connection.
///
/// Every variant is fatal for the connection that produced it; the server
/// funnels all of them through its single close path and never retries.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The peer (or the local transport) reported a clean end of stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection was already marked for closing.
    #[error("connection is closing")]
    Closing,

    /// The read buffer is full and already at its size ceiling.
    #[error("read buffer exhausted at {limit} bytes")]
    ReadBufferExhausted { limit: usize },

    /// Appending would push the write queue past its cap.
    #[error("write queue full: {queued} queued + {requested} requested exceeds {limit} bytes")]
    WriteQueueFull {
        queued: usize,
        requested: usize,
        limit: usize,
    },

    /// The TLS layer refused to wrap or negotiate.
    #[error("tls: {0}")]
    Tls(String),

    /// Any other transport failure.
    #[error("i/o error: {0}")]
    Io(io::Error),
}

impl NetError {
    /// Whether this is the orderly end-of-stream case rather than a failure.
    pub fn is_orderly_close(&self) -> bool {
        matches!(self, NetError::ConnectionClosed)
    }

    /// Short, stable label used for metrics and structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            NetError::ConnectionClosed => "closed",
            NetError::Closing => "closing",
            NetError::ReadBufferExhausted { .. } => "read_buffer_exhausted",
            NetError::WriteQueueFull { .. } => "write_queue_full",
            NetError::Tls(_) => "tls",
            NetError::Io(_) => "io",
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            // A peer hanging up mid-record is still an end of stream.
            io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
            _ => NetError::Io(err),
        }
    }
}
