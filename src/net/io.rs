//! Transport capabilities consumed by the connection engine.
//!
//! # Contract
//! - Each call returns either a finished result or [`IoStatus::Pending`]
//! - A pending call is resumed by exactly one notification, posted through
//!   the [`Notifier`] handed to that call
//! - `Ok(0)` from `read` or `write` is an orderly close
//! - A pending `read` reports the bytes it read in the notification; the
//!   connection copies them into the buffer it originally offered

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::NetError;
use crate::event::{Completion, Event, EventSink};
use crate::server::ConnectionId;

/// Outcome of issuing a transport operation.
#[derive(Debug)]
#[must_use]
pub enum IoStatus<T> {
    Ready(Result<T, NetError>),
    Pending,
}

impl<T> IoStatus<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, IoStatus::Pending)
    }
}

/// A connected byte stream.
pub trait Transport: Any + Send {
    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8], notifier: Notifier) -> IoStatus<usize>;

    /// Write a prefix of `buf`; the returned count may be short.
    fn write(&mut self, buf: &[u8], notifier: Notifier) -> IoStatus<usize>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Recover the concrete type, used by TLS contexts that upgrade in place.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// A transport that has been handed to a TLS layer.
pub trait TlsTransport: Transport {
    fn handshake(&mut self, notifier: Notifier) -> IoStatus<()>;
}

/// Wraps raw transports into encrypted ones.
pub trait TlsContext: Send {
    /// Take ownership of `raw`; on success the returned handle replaces it.
    fn wrap(&self, raw: Box<dyn Transport>) -> Result<Box<dyn TlsTransport>, NetError>;
}

/// The listening side.
pub trait Listener: Send {
    fn accept(&mut self, notifier: AcceptNotifier) -> IoStatus<Box<dyn Transport>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Completion callback for one pending read, write or handshake.
///
/// Consumed on use, so a pending operation can be resumed only once.
#[derive(Clone)]
pub struct Notifier {
    id: ConnectionId,
    sink: Arc<dyn EventSink>,
}

impl Notifier {
    pub fn new(id: ConnectionId, sink: Arc<dyn EventSink>) -> Self {
        Self { id, sink }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn read_completed(self, result: Result<Bytes, NetError>) {
        self.complete(Completion::Read(result));
    }

    pub fn write_completed(self, result: Result<usize, NetError>) {
        self.complete(Completion::Write(result));
    }

    pub fn handshake_completed(self, result: Result<(), NetError>) {
        self.complete(Completion::Handshake(result));
    }

    fn complete(self, completion: Completion) {
        self.sink.post(Event::Io {
            id: self.id,
            completion,
        });
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("id", &self.id).finish()
    }
}

/// Completion callback for a pending accept.
#[derive(Clone)]
pub struct AcceptNotifier {
    sink: Arc<dyn EventSink>,
}

impl AcceptNotifier {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn accepted(self, result: Result<Box<dyn Transport>, NetError>) {
        self.sink.post(Event::Accepted(result));
    }
}
