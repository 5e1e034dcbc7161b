//! Events consumed by the owner task.
//!
//! Everything that must touch server or connection state is posted here
//! first: I/O completions from transport tasks, close/send requests from
//! other threads, and connections whose destruction was deferred.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::NetError;
use crate::net::Transport;
use crate::server::{Connection, ConnectionId};

/// Result of one pending transport operation.
#[derive(Debug)]
pub enum Completion {
    /// Bytes read; an empty buffer is an orderly close.
    Read(Result<Bytes, NetError>),
    /// Number of bytes the transport accepted.
    Write(Result<usize, NetError>),
    Handshake(Result<(), NetError>),
}

/// Unit of work for the owner task.
pub enum Event {
    /// Begin accepting; posted once at construction so the delegate is never
    /// called back before the server is fully built.
    StartAccepting,
    Accepted(Result<Box<dyn Transport>, NetError>),
    Io {
        id: ConnectionId,
        completion: Completion,
    },
    Close(ConnectionId),
    Send {
        id: ConnectionId,
        data: Bytes,
    },
    /// A closed connection, dropped when this event is handled.
    Destroy(Box<Connection>),
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::StartAccepting => write!(f, "StartAccepting"),
            Event::Accepted(Ok(_)) => write!(f, "Accepted(Ok)"),
            Event::Accepted(Err(e)) => write!(f, "Accepted(Err({e}))"),
            Event::Io { id, completion } => write!(f, "Io({id}, {completion:?})"),
            Event::Close(id) => write!(f, "Close({id})"),
            Event::Send { id, data } => write!(f, "Send({id}, {} bytes)", data.len()),
            Event::Destroy(conn) => write!(f, "Destroy({})", conn.id()),
        }
    }
}

/// Single-consumer task queue feeding the owner task.
pub trait EventSink: Send + Sync {
    fn post(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn post(&self, event: Event) {
        if self.send(event).is_err() {
            tracing::trace!("Event loop gone, dropping event");
        }
    }
}

/// Create the channel the [`EventLoop`](crate::lifecycle::EventLoop) drains.
pub fn event_channel() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

/// In-memory queue drained by hand, for driving a server step by step.
#[derive(Clone, Default)]
pub struct ManualQueue {
    events: Arc<Mutex<VecDeque<Event>>>,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<Event> {
        self.events.lock().expect("event queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("event queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued event, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        self.events
            .lock()
            .expect("event queue poisoned")
            .drain(..)
            .collect()
    }
}

impl EventSink for ManualQueue {
    fn post(&self, event: Event) {
        self.events
            .lock()
            .expect("event queue poisoned")
            .push_back(event);
    }
}
