//! Accept loop, completion dispatch and the single close path.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use super::connection::{Connection, ConnectionSettings, Context, Progress, Step};
use super::delegate::Delegate;
use super::registry::{ConnectionId, ConnectionStatus, SessionRegistry};
use crate::buffer::ReadBufferLimits;
use crate::config::GatewayConfig;
use crate::error::NetError;
use crate::event::{Completion, Event, EventSink};
use crate::net::{AcceptNotifier, IoStatus, Listener, TlsContext, Transport};
use crate::observability::metrics;

/// Admission and buffer policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Connections past this count are accepted and dropped at once.
    pub max_concurrent: usize,
    pub connection: ConnectionSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            connection: ConnectionSettings::default(),
        }
    }
}

impl From<&GatewayConfig> for ServerSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            max_concurrent: config.listener.max_connections,
            connection: ConnectionSettings {
                max_write_buffer_bytes: config.connection.max_write_buffer_bytes,
                read_buffer: ReadBufferLimits {
                    initial: config.connection.read_buffer_initial_bytes,
                    max: config.connection.read_buffer_max_bytes,
                },
            },
        }
    }
}

/// Owns the listener, the TLS context, the delegate and every connection.
///
/// All mutation happens on one owner task through [`handle_event`]; other
/// threads use a [`ServerHandle`] or the [`SessionRegistry`] queries.
///
/// [`handle_event`]: Server::handle_event
pub struct Server {
    listener: Box<dyn Listener>,
    tls: Box<dyn TlsContext>,
    delegate: Box<dyn Delegate>,
    sink: Arc<dyn EventSink>,
    registry: SessionRegistry,
    settings: ServerSettings,
    last_id: ConnectionId,
    accepting: bool,
}

impl Server {
    /// Build the server. Accepting begins when the posted
    /// [`Event::StartAccepting`] is handled, never inside this call.
    pub fn new(
        listener: Box<dyn Listener>,
        tls: Box<dyn TlsContext>,
        delegate: Box<dyn Delegate>,
        sink: Arc<dyn EventSink>,
        settings: ServerSettings,
    ) -> Self {
        sink.post(Event::StartAccepting);
        Self {
            listener,
            tls,
            delegate,
            sink,
            registry: SessionRegistry::new(),
            settings,
            last_id: ConnectionId::new(0),
            accepting: true,
        }
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            sink: Arc::clone(&self.sink),
        }
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::StartAccepting => self.do_accept_loop(),
            Event::Accepted(result) => {
                if self.handle_accept_result(result).is_ok() {
                    self.do_accept_loop();
                }
            }
            Event::Io { id, completion } => self.dispatch(id, completion),
            Event::Close(id) => self.close(id),
            Event::Send { id, data } => self.send(id, data),
            Event::Destroy(connection) => {
                tracing::trace!(connection_id = %connection.id(), "Releasing closed connection");
                drop(connection);
            }
        }
    }

    /// Run `f` against a live connection on the owner task.
    ///
    /// `None` if the id is unknown or closing.
    pub fn with_connection<R>(
        &mut self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        let mut connection = self.registry.check_out(id)?;
        let result = f(&mut connection);
        self.settle(connection, Ok(Progress::Complete));
        Some(result)
    }

    /// Close `id` now: remove it from the map, notify the delegate, and
    /// queue the connection for release. Unknown ids are ignored.
    pub fn close(&mut self, id: ConnectionId) {
        let Some(slot) = self.registry.remove(id) else {
            tracing::debug!(connection_id = %id, "Close for unknown connection ignored");
            return;
        };
        match slot.connection {
            Some(connection) => self.retire(connection, "requested"),
            // Whoever holds it sees the missing slot at check-in.
            None => {
                slot.status.mark_closing();
            }
        }
    }

    /// Close the first connection whose disconnect deadline has passed.
    ///
    /// At most one per call, so a burst of expiries is spread over ticks.
    pub fn sweep(&mut self, now: Instant) -> Option<ConnectionId> {
        let id = self.registry.first_due(now)?;
        tracing::info!(connection_id = %id, "Disconnect deadline passed");
        self.close(id);
        Some(id)
    }

    /// Stop accepting and close every connection inline.
    pub fn shutdown(&mut self) {
        self.accepting = false;
        let slots = self.registry.drain();
        tracing::info!(connections = slots.len(), "Closing all connections");

        for slot in slots {
            slot.status.mark_closing();
            if let Some(connection) = slot.connection {
                metrics::record_connection_closed("shutdown");
                self.delegate.on_close(&connection);
            }
        }
        metrics::set_active_connections(0);
    }

    fn send(&mut self, id: ConnectionId, data: Bytes) {
        match self.with_connection(id, |connection| connection.send(data)) {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::debug!(connection_id = %id, error = %err, "Queued send failed");
            }
            None => tracing::debug!(connection_id = %id, "Dropping send for closed connection"),
        }
    }

    fn do_accept_loop(&mut self) {
        while self.accepting {
            let notifier = AcceptNotifier::new(Arc::clone(&self.sink));
            match self.listener.accept(notifier) {
                IoStatus::Pending => return,
                IoStatus::Ready(result) => {
                    if self.handle_accept_result(result).is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn handle_accept_result(
        &mut self,
        result: Result<Box<dyn Transport>, NetError>,
    ) -> Result<(), NetError> {
        let transport = match result {
            Ok(transport) => transport,
            // Failures like ECONNABORTED or EMFILE concern one attempt, not
            // the listening socket; keep accepting.
            Err(err) => {
                tracing::warn!(error = %err, "Accept failed");
                metrics::record_accept_error(err.reason());
                return Ok(());
            }
        };

        if !self.accepting {
            tracing::debug!(peer = ?transport.peer_addr(), "Dropping connection accepted during shutdown");
            return Err(NetError::Closing);
        }

        if self.registry.len() >= self.settings.max_concurrent {
            tracing::info!(
                peer = ?transport.peer_addr(),
                max_connections = self.settings.max_concurrent,
                "At capacity, declining connection"
            );
            metrics::record_connection_declined();
            drop(transport);
            return Ok(());
        }

        let id = self.next_id();
        let status = Arc::new(ConnectionStatus::new(id, transport.peer_addr()));
        let mut connection = Box::new(Connection::new(
            Arc::clone(&status),
            transport,
            Arc::clone(&self.sink),
            &self.settings.connection,
        ));
        self.registry.insert_checked_out(status);

        tracing::info!(
            connection_id = %id,
            peer = ?connection.peer_addr(),
            active = self.registry.len(),
            "Connection accepted"
        );
        metrics::record_connection_accepted();
        metrics::set_active_connections(self.registry.len());

        let mut cx = Context {
            delegate: self.delegate.as_mut(),
            tls: self.tls.as_ref(),
        };
        let step = connection.start(&mut cx);
        self.settle(connection, step);
        Ok(())
    }

    /// Route one completion to its connection. Completions for connections
    /// that closed meanwhile are dropped.
    pub(crate) fn dispatch(&mut self, id: ConnectionId, completion: Completion) {
        let Some(mut connection) = self.registry.check_out(id) else {
            tracing::trace!(connection_id = %id, ?completion, "Dropping completion for closed connection");
            return;
        };

        let mut cx = Context {
            delegate: self.delegate.as_mut(),
            tls: self.tls.as_ref(),
        };
        let step = match completion {
            Completion::Read(result) => connection.on_read_completed(&mut cx, result),
            Completion::Write(result) => connection.on_write_completed(&mut cx, result),
            Completion::Handshake(result) => connection.on_handshake_completed(&mut cx, result),
        };
        self.settle(connection, step);
    }

    /// Return a checked-out connection to the map, or close it on error.
    fn settle(&mut self, connection: Box<Connection>, step: Step) {
        match step {
            Ok(_) => {
                if let Err(orphan) = self.registry.check_in(connection) {
                    self.retire(orphan, "requested");
                }
            }
            Err(err) => {
                let id = connection.id();
                match err {
                    NetError::ConnectionClosed => {
                        tracing::info!(connection_id = %id, "Peer closed connection");
                    }
                    NetError::Closing => {
                        tracing::debug!(connection_id = %id, "Closing on request");
                    }
                    _ => tracing::warn!(connection_id = %id, error = %err, "Connection failed"),
                }
                self.registry.remove(id);
                self.retire(connection, err.reason());
            }
        }
    }

    /// The single close path. The caller has already removed the slot.
    fn retire(&mut self, connection: Box<Connection>, reason: &'static str) {
        connection.mark_closing();
        metrics::record_connection_closed(reason);
        metrics::set_active_connections(self.registry.len());

        self.delegate.on_close(&connection);
        tracing::info!(connection_id = %connection.id(), reason, "Connection closed");

        // Callers up the stack may still be unwinding out of this
        // connection's callbacks; release it on a later turn.
        self.sink.post(Event::Destroy(connection));
    }

    fn next_id(&mut self) -> ConnectionId {
        loop {
            self.last_id = self.last_id.next();
            if !self.registry.contains(self.last_id) {
                return self.last_id;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_id(&mut self, id: ConnectionId) {
        self.last_id = id;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            tracing::warn!(
                connections = self.registry.len(),
                "Server dropped without shutdown"
            );
        }
    }
}

/// Thread-safe handle that posts requests to the owner task.
#[derive(Clone)]
pub struct ServerHandle {
    sink: Arc<dyn EventSink>,
}

impl ServerHandle {
    pub fn close(&self, id: ConnectionId) {
        self.sink.post(Event::Close(id));
    }

    pub fn send(&self, id: ConnectionId, data: impl Into<Bytes>) {
        self.sink.post(Event::Send {
            id,
            data: data.into(),
        });
    }
}
