//! Per-connection protocol state machine.
//!
//! # States
//! ```text
//! Idle ─start─▶ ReadHandshakeRequest ─▶ ReadHandshakeRequestComplete
//!                     ▲                          │ (no response yet)
//!                     └──────────────────────────┤
//!                                                ▼
//!   WriteHandshakeResponse ─▶ WriteHandshakeResponseComplete
//!                                                │
//!   TlsHandshake ─▶ TlsHandshakeComplete ─▶ ReadMessage ⇄ ReadMessageComplete
//! ```
//!
//! # Driving
//! One loop runs "the action for the current state" until an operation is
//! pending or nothing is left to do. Completions re-enter the same loop, so
//! the stack never grows with the number of messages.
//!
//! # Handshake request
//! A request read that leaves no response cached goes back to reading, so a
//! request split across reads is answered once it is whole. A delegate that
//! never answers therefore keeps the connection reading until the read
//! buffer reaches its ceiling and the connection closes with
//! [`NetError::ReadBufferExhausted`], or until something else closes it.

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use super::delegate::{Delegate, DeliveryGuard};
use super::registry::{ConnectionId, ConnectionStatus};
use crate::buffer::{ByteQueue, ReadBuffer, ReadBufferLimits};
use crate::error::NetError;
use crate::event::{Event, EventSink};
use crate::net::{IoStatus, Notifier, TlsContext, TlsTransport, Transport};

/// Default cap on queued outbound bytes.
pub const DEFAULT_MAX_WRITE_BUFFER_BYTES: usize = 3 * 1024 * 1024;

/// The write buffer raises its alert at this fraction of the cap.
const ALERT_DIVISOR: usize = 4;

/// Position in the connection's protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ReadHandshakeRequest,
    ReadHandshakeRequestComplete,
    WriteHandshakeResponse,
    WriteHandshakeResponseComplete,
    TlsHandshake,
    TlsHandshakeComplete,
    ReadMessage,
    ReadMessageComplete,
    /// Not started yet, or nothing queued between loop iterations.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Complete,
    Pending,
}

pub(crate) type Step = Result<Progress, NetError>;

/// Server-owned collaborators lent to a connection while it runs.
pub(crate) struct Context<'a> {
    pub(crate) delegate: &'a mut dyn Delegate,
    pub(crate) tls: &'a dyn TlsContext,
}

/// Buffer limits applied to every new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub max_write_buffer_bytes: usize,
    pub read_buffer: ReadBufferLimits,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_write_buffer_bytes: DEFAULT_MAX_WRITE_BUFFER_BYTES,
            read_buffer: ReadBufferLimits::default(),
        }
    }
}

/// The connection's transport before and after the TLS upgrade.
enum Link {
    Raw(Box<dyn Transport>),
    Tls(Box<dyn TlsTransport>),
    /// Only while the raw transport is inside `TlsContext::wrap`, or after
    /// a failed wrap consumed it.
    Detached,
}

impl Link {
    fn read(&mut self, buf: &mut [u8], notifier: Notifier) -> IoStatus<usize> {
        match self {
            Link::Raw(transport) => transport.read(buf, notifier),
            Link::Tls(transport) => transport.read(buf, notifier),
            Link::Detached => IoStatus::Ready(Err(NetError::ConnectionClosed)),
        }
    }

    fn write(&mut self, buf: &[u8], notifier: Notifier) -> IoStatus<usize> {
        match self {
            Link::Raw(transport) => transport.write(buf, notifier),
            Link::Tls(transport) => transport.write(buf, notifier),
            Link::Detached => IoStatus::Ready(Err(NetError::ConnectionClosed)),
        }
    }
}

/// One accepted client session.
///
/// Owned by the server's connection map; the embedder reaches it through
/// [`Delegate`] callbacks and [`Server::with_connection`](super::Server::with_connection).
pub struct Connection {
    status: Arc<ConnectionStatus>,
    link: Link,
    read_buffer: ReadBuffer,
    write_queue: ByteQueue,
    state: State,
    sink: Arc<dyn EventSink>,
    handshake_response: Option<Bytes>,
    handshake_response_sent: bool,
    alert_threshold_bytes: usize,
    disconnect_deadline: Option<Instant>,
    backpressure_credit: i64,
    /// Length of the region currently lent to the delegate.
    delivery_window: Option<usize>,
    read_in_flight: bool,
    write_in_flight: bool,
    handshake_in_flight: bool,
}

impl Connection {
    pub(crate) fn new(
        status: Arc<ConnectionStatus>,
        transport: Box<dyn Transport>,
        sink: Arc<dyn EventSink>,
        settings: &ConnectionSettings,
    ) -> Self {
        let max = settings.max_write_buffer_bytes;
        let alert_threshold_bytes = max / ALERT_DIVISOR;

        tracing::debug!(
            connection_id = %status.id(),
            max_write_buffer_bytes = max,
            alert_threshold_bytes,
            "Connection created"
        );

        Self {
            status,
            link: Link::Raw(transport),
            read_buffer: ReadBuffer::new(settings.read_buffer),
            write_queue: ByteQueue::new(max),
            state: State::Idle,
            sink,
            handshake_response: None,
            handshake_response_sent: false,
            alert_threshold_bytes,
            disconnect_deadline: None,
            backpressure_credit: 0,
            delivery_window: None,
            read_in_flight: false,
            write_in_flight: false,
            handshake_in_flight: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.status.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.status.peer_addr()
    }

    /// Shared status, the same object registry queries return.
    pub fn status(&self) -> &Arc<ConnectionStatus> {
        &self.status
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        self.status.is_closing()
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.link, Link::Tls(_))
    }

    pub fn created_at(&self) -> Instant {
        self.status.created_at()
    }

    pub fn handshake_completed_at(&self) -> Option<Instant> {
        self.status.handshake_completed_at()
    }

    pub fn is_handshaked(&self) -> bool {
        self.status.is_handshaked()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.status.finished_at()
    }

    /// Record that the application-level exchange finished.
    ///
    /// # Panics
    /// If called twice, before the TLS handshake, or with a time not after
    /// the handshake.
    pub fn set_finished_at(&self, at: Instant) {
        self.status.record_finished(at);
    }

    pub fn max_write_buffer_bytes(&self) -> usize {
        self.write_queue.max_bytes()
    }

    pub fn alert_threshold_bytes(&self) -> usize {
        self.alert_threshold_bytes
    }

    pub fn queued_write_bytes(&self) -> usize {
        self.write_queue.queued_bytes()
    }

    /// Whether queued output has reached the alert threshold. Producers
    /// should hold back until it drains.
    pub fn write_buffer_is_alert(&self) -> bool {
        self.write_queue.queued_bytes() >= self.alert_threshold_bytes
    }

    pub fn disconnect_deadline(&self) -> Option<Instant> {
        self.disconnect_deadline
    }

    pub fn set_disconnect_deadline(&mut self, deadline: Option<Instant>) {
        self.disconnect_deadline = deadline;
    }

    /// Whether the disconnect deadline has passed. Acting on it is the
    /// caller's job.
    pub fn should_disconnect(&self, now: Instant) -> bool {
        self.disconnect_deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn backpressure_credit(&self) -> i64 {
        self.backpressure_credit
    }

    pub fn increase_backpressure_credit(&mut self) {
        self.backpressure_credit += 1;
    }

    pub fn decrease_backpressure_credit(&mut self) {
        self.backpressure_credit -= 1;
    }

    /// Queue `data` for the peer.
    ///
    /// Until the handshake response has gone out, the payload is kept as that
    /// response instead; nothing else may reach the wire first.
    ///
    /// Failure marks the connection for closing.
    pub fn send(&mut self, data: impl Into<Bytes>) -> Result<usize, NetError> {
        let data = data.into();
        if self.is_closing() {
            return Err(NetError::Closing);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let len = data.len();
        if !self.handshake_response_sent {
            tracing::trace!(connection_id = %self.id(), len, "Caching handshake response");
            self.handshake_response = Some(data);
            return Ok(len);
        }

        let writing = !self.write_queue.is_empty();
        let queued = self.write_queue.queued_bytes();
        if !self.write_queue.append(data) {
            let err = NetError::WriteQueueFull {
                queued,
                requested: len,
                limit: self.write_queue.max_bytes(),
            };
            tracing::warn!(connection_id = %self.id(), error = %err, "Producer ignored write alert");
            self.request_close();
            return Err(err);
        }

        if !writing {
            if let Err(err) = self.do_write() {
                self.request_close();
                return Err(err);
            }
        }
        Ok(len)
    }

    /// Mark the connection closing and ask the server to close it on its
    /// next turn. Safe from inside any delegate callback.
    pub fn request_close(&mut self) {
        if self.status.mark_closing() {
            tracing::debug!(connection_id = %self.id(), "Close requested");
            self.sink.post(Event::Close(self.id()));
        }
    }

    pub(crate) fn mark_closing(&self) {
        self.status.mark_closing();
    }

    pub(crate) fn start(&mut self, cx: &mut Context<'_>) -> Step {
        assert_eq!(self.state, State::Idle, "{}: started twice", self.id());

        cx.delegate.on_connect(self);
        if self.is_closing() {
            return Err(NetError::Closing);
        }

        self.state = State::ReadHandshakeRequest;
        self.run(cx, Ok(Progress::Complete))
    }

    fn run(&mut self, cx: &mut Context<'_>, mut rv: Step) -> Step {
        loop {
            let state = mem::replace(&mut self.state, State::Idle);
            rv = match state {
                State::ReadHandshakeRequest => {
                    self.state = State::ReadHandshakeRequestComplete;
                    self.do_read(cx)
                }
                State::ReadHandshakeRequestComplete => {
                    rv?;
                    // A partial request leaves no response yet; read more.
                    self.state = if self.handshake_response.is_some() {
                        State::WriteHandshakeResponse
                    } else {
                        State::ReadHandshakeRequest
                    };
                    Ok(Progress::Complete)
                }
                State::WriteHandshakeResponse => {
                    self.state = State::WriteHandshakeResponseComplete;
                    self.write_handshake_response()
                }
                State::WriteHandshakeResponseComplete => {
                    rv?;
                    self.state = State::TlsHandshake;
                    Ok(Progress::Complete)
                }
                State::TlsHandshake => {
                    self.state = State::TlsHandshakeComplete;
                    self.do_handshake(cx)
                }
                State::TlsHandshakeComplete => {
                    rv?;
                    self.status.record_handshake(Instant::now());
                    tracing::info!(connection_id = %self.id(), "TLS handshake complete");
                    self.state = State::ReadMessage;
                    Ok(Progress::Complete)
                }
                State::ReadMessage => {
                    self.state = State::ReadMessageComplete;
                    self.do_read(cx)
                }
                State::ReadMessageComplete => {
                    rv?;
                    self.state = State::ReadMessage;
                    Ok(Progress::Complete)
                }
                State::Idle => panic!("{}: state machine driven while idle", self.id()),
            };

            if matches!(rv, Ok(Progress::Pending)) || self.state == State::Idle {
                return rv;
            }
        }
    }

    pub(crate) fn on_read_completed(
        &mut self,
        cx: &mut Context<'_>,
        result: Result<Bytes, NetError>,
    ) -> Step {
        assert!(
            self.read_in_flight
                && matches!(
                    self.state,
                    State::ReadHandshakeRequestComplete | State::ReadMessageComplete
                ),
            "{}: read completion while {:?}",
            self.id(),
            self.state
        );
        self.read_in_flight = false;

        let result = result.map(|bytes| self.absorb(&bytes));
        let rv = self.handle_read_result(cx, result);
        self.run(cx, rv)
    }

    pub(crate) fn on_write_completed(
        &mut self,
        cx: &mut Context<'_>,
        result: Result<usize, NetError>,
    ) -> Step {
        assert!(
            self.write_in_flight,
            "{}: write completion with no write in flight ({:?})",
            self.id(),
            self.state
        );
        self.write_in_flight = false;

        let rv = match self.handle_write_result(result) {
            Ok(()) => self.do_write(),
            Err(err) => Err(err),
        };
        if matches!(rv, Ok(Progress::Pending)) {
            return rv;
        }
        if self.state == State::WriteHandshakeResponseComplete {
            self.run(cx, rv)
        } else {
            rv
        }
    }

    pub(crate) fn on_handshake_completed(
        &mut self,
        cx: &mut Context<'_>,
        result: Result<(), NetError>,
    ) -> Step {
        assert!(
            self.handshake_in_flight && self.state == State::TlsHandshakeComplete,
            "{}: handshake completion while {:?}",
            self.id(),
            self.state
        );
        self.handshake_in_flight = false;

        let rv = result.map(|()| Progress::Complete);
        self.run(cx, rv)
    }

    fn notifier(&self) -> Notifier {
        Notifier::new(self.id(), Arc::clone(&self.sink))
    }

    fn do_read(&mut self, cx: &mut Context<'_>) -> Step {
        if self.read_buffer.remaining_capacity() == 0 {
            let capacity = self.read_buffer.increase_capacity()?;
            tracing::trace!(connection_id = %self.id(), capacity, "Read buffer grown");
        }

        let notifier = self.notifier();
        match self.link.read(self.read_buffer.spare_mut(), notifier) {
            IoStatus::Pending => {
                self.read_in_flight = true;
                Ok(Progress::Pending)
            }
            IoStatus::Ready(result) => self.handle_read_result(cx, result),
        }
    }

    /// Copy a pending read's bytes into the space that read was offered.
    fn absorb(&mut self, bytes: &[u8]) -> usize {
        let spare = self.read_buffer.spare_mut();
        assert!(
            bytes.len() <= spare.len(),
            "transport returned {} bytes for a {}-byte read",
            bytes.len(),
            spare.len()
        );
        spare[..bytes.len()].copy_from_slice(bytes);
        bytes.len()
    }

    fn handle_read_result(
        &mut self,
        cx: &mut Context<'_>,
        result: Result<usize, NetError>,
    ) -> Step {
        let n = match result {
            Ok(0) => return Err(NetError::ConnectionClosed),
            Ok(n) => n,
            Err(err) => return Err(err),
        };

        self.read_buffer.did_read(n);
        self.deliver(cx);

        if self.is_closing() {
            return Err(NetError::Closing);
        }
        Ok(Progress::Complete)
    }

    /// Lend the valid region to the delegate once and drop what it used.
    fn deliver(&mut self, cx: &mut Context<'_>) {
        let mut buffer = mem::take(&mut self.read_buffer);
        self.open_delivery_window(buffer.size());

        let mut guard = DeliveryGuard::new(buffer.data());
        cx.delegate.on_message(&mut guard, self);
        let consumed = guard.consumed();

        self.close_delivery_window(consumed);
        if consumed != buffer.size() {
            tracing::trace!(
                connection_id = %self.id(),
                consumed,
                buffered = buffer.size(),
                "Partial message kept for next read"
            );
        }
        buffer.did_consume(consumed);
        self.read_buffer = buffer;
    }

    fn open_delivery_window(&mut self, len: usize) {
        assert!(
            self.delivery_window.is_none(),
            "{}: re-entrant delivery",
            self.id()
        );
        self.delivery_window = Some(len);
    }

    fn close_delivery_window(&mut self, consumed: usize) {
        let Some(len) = self.delivery_window.take() else {
            panic!("{}: delivery window closed twice", self.id());
        };
        assert!(consumed <= len, "{}: consumed past delivery", self.id());
    }

    fn write_handshake_response(&mut self) -> Step {
        let Some(response) = self.handshake_response.take() else {
            panic!("{}: no handshake response to write", self.id());
        };
        assert!(
            self.write_queue.is_empty(),
            "{}: output queued before the handshake response",
            self.id()
        );

        self.handshake_response_sent = true;
        let len = response.len();
        if !self.write_queue.append(response) {
            return Err(NetError::WriteQueueFull {
                queued: 0,
                requested: len,
                limit: self.write_queue.max_bytes(),
            });
        }
        self.do_write()
    }

    fn do_write(&mut self) -> Step {
        loop {
            if self.write_queue.is_empty() {
                return Ok(Progress::Complete);
            }
            debug_assert!(!self.write_in_flight, "write issued while one is in flight");

            let notifier = self.notifier();
            match self.link.write(self.write_queue.chunk(), notifier) {
                IoStatus::Pending => {
                    self.write_in_flight = true;
                    return Ok(Progress::Pending);
                }
                IoStatus::Ready(result) => self.handle_write_result(result)?,
            }
        }
    }

    fn handle_write_result(&mut self, result: Result<usize, NetError>) -> Result<(), NetError> {
        match result {
            Ok(0) => Err(NetError::ConnectionClosed),
            Ok(n) => {
                self.write_queue.consume(n);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn do_handshake(&mut self, cx: &mut Context<'_>) -> Step {
        let raw = match mem::replace(&mut self.link, Link::Detached) {
            Link::Raw(raw) => raw,
            _ => panic!("{}: TLS upgrade of a non-raw transport", self.id()),
        };

        let mut tls = cx.tls.wrap(raw)?;
        let status = tls.handshake(self.notifier());
        self.link = Link::Tls(tls);

        match status {
            IoStatus::Pending => {
                self.handshake_in_flight = true;
                Ok(Progress::Pending)
            }
            IoStatus::Ready(result) => result.map(|()| Progress::Complete),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::trace!(connection_id = %self.id(), "Connection destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ManualQueue;
    use crate::testing::{
        DelegateEvent, DelegateLog, HandshakeStep, ReadStep, RecordingDelegate, ScriptedTls,
        TransportProbe, WriteMode,
    };

    const REQUEST: &[u8] = b"connection-request";
    const CONFIRM: &[u8] = b"confirm";

    struct Fixture {
        connection: Connection,
        probe: TransportProbe,
        delegate: RecordingDelegate,
        log: DelegateLog,
        tls: ScriptedTls,
        queue: ManualQueue,
    }

    impl Fixture {
        fn new(settings: ConnectionSettings) -> Self {
            let probe = TransportProbe::new();
            let queue = ManualQueue::new();
            let log = DelegateLog::default();
            let status = Arc::new(ConnectionStatus::new(ConnectionId::new(7), None));
            let connection = Connection::new(
                status,
                probe.transport(),
                Arc::new(queue.clone()),
                &settings,
            );
            Self {
                connection,
                probe,
                delegate: RecordingDelegate::new(log.clone()).with_handshake_response(CONFIRM),
                log,
                tls: ScriptedTls::new(),
                queue,
            }
        }

        fn cx(&mut self) -> (&mut Connection, Context<'_>) {
            (
                &mut self.connection,
                Context {
                    delegate: &mut self.delegate,
                    tls: &self.tls,
                },
            )
        }

        fn start(&mut self) -> Step {
            let (connection, mut cx) = self.cx();
            connection.start(&mut cx)
        }
    }

    #[test]
    fn synchronous_success_reaches_read_message() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.probe.push_read(ReadStep::Data(REQUEST.to_vec()));

        let step = fx.start();

        assert!(matches!(step, Ok(Progress::Pending)));
        assert_eq!(fx.connection.state(), State::ReadMessageComplete);
        assert!(fx.connection.is_tls());
        assert!(fx.connection.is_handshaked());
        assert_eq!(fx.probe.written(), CONFIRM);
        assert_eq!(fx.probe.write_calls(), 1);
        assert_eq!(fx.probe.handshakes(), 1);
        assert_eq!(
            fx.log.events(),
            vec![
                DelegateEvent::Connect(ConnectionId::new(7)),
                DelegateEvent::Message(ConnectionId::new(7), REQUEST.to_vec()),
            ]
        );
    }

    #[test]
    fn unanswered_request_reads_until_buffer_ceiling() {
        let mut fx = Fixture::new(ConnectionSettings {
            read_buffer: ReadBufferLimits {
                initial: 128,
                max: 256,
            },
            ..ConnectionSettings::default()
        });
        fx.delegate = RecordingDelegate::new(fx.log.clone()).consuming(|_| 0);
        for _ in 0..3 {
            fx.probe.push_read(ReadStep::Data(vec![0x03; 128]));
        }

        let step = fx.start();

        assert!(matches!(
            step,
            Err(NetError::ReadBufferExhausted { limit: 256 })
        ));
        assert_eq!(fx.probe.read_calls(), 2);
        assert_eq!(fx.probe.write_calls(), 0);
        assert_eq!(fx.log.messages().len(), 2);
    }

    #[test]
    fn partial_request_reads_again_before_responding() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.delegate = RecordingDelegate::new(fx.log.clone())
            .with_handshake_response(CONFIRM)
            .consuming(|data| if data.len() >= 8 { data.len() } else { 0 })
            .responding_after(8);
        fx.probe.push_read(ReadStep::Data(b"conn".to_vec()));

        assert!(matches!(fx.start(), Ok(Progress::Pending)));
        assert_eq!(fx.connection.state(), State::ReadHandshakeRequestComplete);
        assert!(fx.probe.written().is_empty());

        let (connection, mut cx) = fx.cx();
        let step = connection.on_read_completed(&mut cx, Ok(Bytes::from_static(b"ect!")));
        assert!(matches!(step, Ok(Progress::Pending)));
        assert_eq!(fx.connection.state(), State::ReadMessageComplete);
        assert_eq!(fx.probe.written(), CONFIRM);
        assert_eq!(
            fx.log.messages(),
            vec![b"conn".to_vec(), b"connect!".to_vec()]
        );
    }

    #[test]
    fn pending_operations_resume_through_completions() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.probe.set_write_mode(WriteMode::Pending);
        fx.probe.set_handshake(HandshakeStep::Pending);

        assert!(matches!(fx.start(), Ok(Progress::Pending)));
        assert_eq!(fx.connection.state(), State::ReadHandshakeRequestComplete);

        let (connection, mut cx) = fx.cx();
        let step = connection.on_read_completed(&mut cx, Ok(Bytes::from_static(REQUEST)));
        assert!(matches!(step, Ok(Progress::Pending)));
        assert_eq!(fx.connection.state(), State::WriteHandshakeResponseComplete);

        let written = fx.probe.take_pending_write().unwrap();
        assert_eq!(written, CONFIRM);
        let (connection, mut cx) = fx.cx();
        let step = connection.on_write_completed(&mut cx, Ok(written.len()));
        assert!(matches!(step, Ok(Progress::Pending)));
        assert_eq!(fx.connection.state(), State::TlsHandshakeComplete);
        assert!(fx.connection.is_tls());
        assert!(!fx.connection.is_handshaked());

        let (connection, mut cx) = fx.cx();
        let step = connection.on_handshake_completed(&mut cx, Ok(()));
        assert!(matches!(step, Ok(Progress::Pending)));
        assert_eq!(fx.connection.state(), State::ReadMessageComplete);
        assert!(fx.connection.handshake_completed_at().unwrap() >= fx.connection.created_at());
    }

    #[test]
    fn failed_handshake_propagates() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.probe.push_read(ReadStep::Data(REQUEST.to_vec()));
        fx.probe.set_handshake(HandshakeStep::Fail);

        let step = fx.start();
        assert!(matches!(step, Err(NetError::Tls(_))));
        assert!(!fx.connection.is_handshaked());
    }

    #[test]
    fn orderly_close_during_read() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.probe.push_read(ReadStep::Eof);
        assert!(matches!(fx.start(), Err(NetError::ConnectionClosed)));
        assert_eq!(fx.connection.state(), State::Idle);
    }

    #[test]
    fn send_before_response_is_cached_not_written() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.connection.send(Bytes::from_static(b"early")).unwrap();
        assert!(fx.probe.written().is_empty());
        assert_eq!(fx.connection.queued_write_bytes(), 0);

        fx.probe.push_read(ReadStep::Data(REQUEST.to_vec()));
        fx.delegate = RecordingDelegate::new(fx.log.clone());
        fx.start().unwrap();
        assert_eq!(fx.probe.written(), b"early");
    }

    #[test]
    fn sends_ride_along_on_inflight_write() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.probe.push_read(ReadStep::Data(REQUEST.to_vec()));
        fx.start().unwrap();
        fx.probe.set_write_mode(WriteMode::Pending);

        fx.connection.send(Bytes::from_static(b"one")).unwrap();
        fx.connection.send(Bytes::from_static(b"two")).unwrap();
        assert_eq!(fx.probe.write_calls(), 2);
        assert_eq!(fx.connection.queued_write_bytes(), 6);

        fx.probe.set_write_mode(WriteMode::Accept);
        let first = fx.probe.take_pending_write().unwrap();
        assert_eq!(first, b"one");
        let (connection, mut cx) = fx.cx();
        connection.on_write_completed(&mut cx, Ok(first.len())).unwrap();

        assert_eq!(fx.probe.written(), b"confirmonetwo");
        assert_eq!(fx.connection.queued_write_bytes(), 0);
    }

    #[test]
    fn write_alert_and_cap() {
        let mut fx = Fixture::new(ConnectionSettings {
            max_write_buffer_bytes: 400,
            ..ConnectionSettings::default()
        });
        fx.probe.push_read(ReadStep::Data(REQUEST.to_vec()));
        fx.start().unwrap();
        fx.probe.set_write_mode(WriteMode::Pending);

        assert_eq!(fx.connection.alert_threshold_bytes(), 100);
        fx.connection.send(vec![1u8; 150]).unwrap();
        assert!(fx.connection.write_buffer_is_alert());
        fx.connection.send(vec![2u8; 250]).unwrap();
        assert_eq!(fx.connection.queued_write_bytes(), 400);

        let err = fx.connection.send(vec![3u8; 1]).unwrap_err();
        assert!(matches!(err, NetError::WriteQueueFull { limit: 400, .. }));
        assert_eq!(fx.connection.queued_write_bytes(), 400);
        assert!(fx.connection.is_closing());
        assert!(matches!(fx.queue.pop(), Some(Event::Close(id)) if id == ConnectionId::new(7)));
    }

    #[test]
    fn disconnect_deadline_is_advisory() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        let now = Instant::now();
        assert!(!fx.connection.should_disconnect(now));

        fx.connection
            .set_disconnect_deadline(Some(now + std::time::Duration::from_secs(5)));
        assert!(!fx.connection.should_disconnect(now));
        assert!(fx.connection.should_disconnect(now + std::time::Duration::from_secs(5)));
        assert!(!fx.connection.is_closing());
    }

    #[test]
    fn backpressure_credit_pairs() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.connection.increase_backpressure_credit();
        fx.connection.increase_backpressure_credit();
        fx.connection.decrease_backpressure_credit();
        assert_eq!(fx.connection.backpressure_credit(), 1);
        fx.connection.decrease_backpressure_credit();
        fx.connection.decrease_backpressure_credit();
        assert_eq!(fx.connection.backpressure_credit(), -1);
    }

    #[test]
    fn read_buffer_exhaustion_is_fatal() {
        let mut fx = Fixture::new(ConnectionSettings {
            read_buffer: ReadBufferLimits { initial: 8, max: 8 },
            ..ConnectionSettings::default()
        });
        fx.delegate = RecordingDelegate::new(fx.log.clone()).consuming(|_| 0);
        fx.probe.push_read(ReadStep::Data(vec![0u8; 8]));

        assert!(matches!(
            fx.start(),
            Err(NetError::ReadBufferExhausted { limit: 8 })
        ));
    }

    #[test]
    #[should_panic(expected = "read completion while")]
    fn read_completion_in_wrong_state_panics() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        let (connection, mut cx) = fx.cx();
        let _ = connection.on_read_completed(&mut cx, Ok(Bytes::from_static(b"x")));
    }

    #[test]
    #[should_panic(expected = "handshake completion while")]
    fn handshake_completion_while_reading_panics() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.start().unwrap();
        let (connection, mut cx) = fx.cx();
        let _ = connection.on_handshake_completed(&mut cx, Ok(()));
    }

    #[test]
    #[should_panic(expected = "no write in flight")]
    fn unsolicited_write_completion_panics() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        let (connection, mut cx) = fx.cx();
        let _ = connection.on_write_completed(&mut cx, Ok(1));
    }

    #[test]
    #[should_panic(expected = "re-entrant delivery")]
    fn nested_delivery_window_panics() {
        let mut fx = Fixture::new(ConnectionSettings::default());
        fx.connection.open_delivery_window(4);
        fx.connection.open_delivery_window(4);
    }
}
