//! Scripted stand-ins for the listener, transports, TLS and the delegate.
//!
//! Everything here completes synchronously unless told to pend, so a
//! [`Server`](crate::server::Server) can be driven step by step from a
//! [`ManualQueue`](crate::event::ManualQueue) without a runtime.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::NetError;
use crate::net::{AcceptNotifier, IoStatus, Listener, Notifier, TlsContext, TlsTransport, Transport};
use crate::server::{Connection, ConnectionId, Delegate, DeliveryGuard};

/// What the next `read` call does.
#[derive(Debug, Clone)]
pub enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Fail(io::ErrorKind),
    Pending,
}

/// How every `write` call behaves until changed.
#[derive(Debug, Clone, Copy, Default)]
pub enum WriteMode {
    #[default]
    Accept,
    /// Accept at most this many bytes per call.
    Short(usize),
    Pending,
    Fail(io::ErrorKind),
}

/// How the TLS handshake behaves.
#[derive(Debug, Clone, Copy, Default)]
pub enum HandshakeStep {
    #[default]
    Complete,
    Pending,
    Fail,
}

#[derive(Default)]
struct TransportState {
    reads: VecDeque<ReadStep>,
    write_mode: WriteMode,
    handshake: HandshakeStep,
    written: Vec<u8>,
    pending_write: Option<Vec<u8>>,
    read_calls: usize,
    write_calls: usize,
    handshakes: usize,
    dropped: bool,
}

/// Test-side view of one [`ScriptedTransport`].
#[derive(Clone, Default)]
pub struct TransportProbe {
    state: Arc<Mutex<TransportState>>,
    peer: Option<SocketAddr>,
}

impl TransportProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().expect("transport probe poisoned")
    }

    /// A transport driven by this probe.
    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(ScriptedTransport {
            probe: self.clone(),
        })
    }

    pub fn push_read(&self, step: ReadStep) {
        self.lock().reads.push_back(step);
    }

    pub fn set_write_mode(&self, mode: WriteMode) {
        self.lock().write_mode = mode;
    }

    pub fn set_handshake(&self, step: HandshakeStep) {
        self.lock().handshake = step;
    }

    /// Bytes the transport accepted, in order.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Finish the pending write: its bytes count as written and are returned.
    pub fn take_pending_write(&self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let bytes = state.pending_write.take()?;
        state.written.extend_from_slice(&bytes);
        Some(bytes)
    }

    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    pub fn write_calls(&self) -> usize {
        self.lock().write_calls
    }

    pub fn handshakes(&self) -> usize {
        self.lock().handshakes
    }

    /// Whether the transport has been dropped.
    pub fn dropped(&self) -> bool {
        self.lock().dropped
    }
}

/// In-memory transport scripted through a [`TransportProbe`].
pub struct ScriptedTransport {
    probe: TransportProbe,
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8], _notifier: Notifier) -> IoStatus<usize> {
        let mut state = self.probe.lock();
        state.read_calls += 1;
        match state.reads.pop_front() {
            Some(ReadStep::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    state.reads.push_front(ReadStep::Data(bytes[n..].to_vec()));
                }
                IoStatus::Ready(Ok(n))
            }
            Some(ReadStep::Eof) => IoStatus::Ready(Ok(0)),
            Some(ReadStep::Fail(kind)) => IoStatus::Ready(Err(io::Error::from(kind).into())),
            Some(ReadStep::Pending) | None => IoStatus::Pending,
        }
    }

    fn write(&mut self, buf: &[u8], _notifier: Notifier) -> IoStatus<usize> {
        let mut state = self.probe.lock();
        state.write_calls += 1;
        match state.write_mode {
            WriteMode::Accept => {
                state.written.extend_from_slice(buf);
                IoStatus::Ready(Ok(buf.len()))
            }
            WriteMode::Short(max) => {
                let n = buf.len().min(max);
                state.written.extend_from_slice(&buf[..n]);
                IoStatus::Ready(Ok(n))
            }
            WriteMode::Pending => {
                state.pending_write = Some(buf.to_vec());
                IoStatus::Pending
            }
            WriteMode::Fail(kind) => IoStatus::Ready(Err(io::Error::from(kind).into())),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.probe.peer
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.probe.lock().dropped = true;
    }
}

/// TLS context that accepts only [`ScriptedTransport`]s and performs the
/// handshake their probe describes.
#[derive(Debug, Default)]
pub struct ScriptedTls {
    refuse: bool,
}

impl ScriptedTls {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose `wrap` always fails.
    pub fn refusing() -> Self {
        Self { refuse: true }
    }
}

impl TlsContext for ScriptedTls {
    fn wrap(&self, raw: Box<dyn Transport>) -> Result<Box<dyn TlsTransport>, NetError> {
        if self.refuse {
            return Err(NetError::Tls("scripted wrap refusal".into()));
        }
        let inner = raw
            .into_any()
            .downcast::<ScriptedTransport>()
            .map_err(|_| NetError::Tls("not a scripted transport".into()))?;
        Ok(Box::new(ScriptedTlsTransport { inner: *inner }))
    }
}

struct ScriptedTlsTransport {
    inner: ScriptedTransport,
}

impl Transport for ScriptedTlsTransport {
    fn read(&mut self, buf: &mut [u8], notifier: Notifier) -> IoStatus<usize> {
        self.inner.read(buf, notifier)
    }

    fn write(&mut self, buf: &[u8], notifier: Notifier) -> IoStatus<usize> {
        self.inner.write(buf, notifier)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl TlsTransport for ScriptedTlsTransport {
    fn handshake(&mut self, _notifier: Notifier) -> IoStatus<()> {
        let mut state = self.inner.probe.lock();
        state.handshakes += 1;
        match state.handshake {
            HandshakeStep::Complete => IoStatus::Ready(Ok(())),
            HandshakeStep::Pending => IoStatus::Pending,
            HandshakeStep::Fail => {
                IoStatus::Ready(Err(NetError::Tls("scripted handshake failure".into())))
            }
        }
    }
}

type AcceptQueue = Arc<Mutex<VecDeque<Result<Box<dyn Transport>, NetError>>>>;

/// Test-side view of a [`ScriptedListener`].
#[derive(Clone, Default)]
pub struct ListenerProbe {
    queue: AcceptQueue,
}

impl ListenerProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> Box<dyn Listener> {
        Box::new(ScriptedListener {
            queue: Arc::clone(&self.queue),
        })
    }

    /// Make `transport` available to the next accept.
    pub fn push(&self, transport: Box<dyn Transport>) {
        self.lock().push_back(Ok(transport));
    }

    pub fn push_error(&self, kind: io::ErrorKind) {
        self.lock().push_back(Err(io::Error::from(kind).into()));
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Result<Box<dyn Transport>, NetError>>> {
        self.queue.lock().expect("listener probe poisoned")
    }
}

/// Listener that hands out queued transports and pends when empty.
pub struct ScriptedListener {
    queue: AcceptQueue,
}

impl Listener for ScriptedListener {
    fn accept(&mut self, _notifier: AcceptNotifier) -> IoStatus<Box<dyn Transport>> {
        match self.queue.lock().expect("listener probe poisoned").pop_front() {
            Some(result) => IoStatus::Ready(result),
            None => IoStatus::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 3389)))
    }
}

/// One delegate callback, as observed by [`RecordingDelegate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateEvent {
    Connect(ConnectionId),
    Message(ConnectionId, Vec<u8>),
    Close(ConnectionId),
}

/// Shared log of delegate callbacks.
#[derive(Clone, Default)]
pub struct DelegateLog {
    events: Arc<Mutex<Vec<DelegateEvent>>>,
}

impl DelegateLog {
    fn push(&self, event: DelegateEvent) {
        self.events.lock().expect("delegate log poisoned").push(event);
    }

    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.lock().expect("delegate log poisoned").clone()
    }

    pub fn connects(&self) -> Vec<ConnectionId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DelegateEvent::Connect(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DelegateEvent::Message(_, bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<ConnectionId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DelegateEvent::Close(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

type ConsumePolicy = Box<dyn FnMut(&[u8]) -> usize + Send>;

/// Delegate that logs every callback and follows a configurable script.
///
/// By default it consumes everything it is shown. With a handshake response
/// set, it sends that response once a pre-handshake delivery holds at least
/// [`responding_after`](Self::responding_after) bytes.
pub struct RecordingDelegate {
    log: DelegateLog,
    handshake_response: Option<Bytes>,
    respond_at: usize,
    consume: ConsumePolicy,
    close_on_message: bool,
}

impl RecordingDelegate {
    pub fn new(log: DelegateLog) -> Self {
        Self {
            log,
            handshake_response: None,
            respond_at: 1,
            consume: Box::new(|data| data.len()),
            close_on_message: false,
        }
    }

    pub fn with_handshake_response(mut self, response: impl Into<Bytes>) -> Self {
        self.handshake_response = Some(response.into());
        self
    }

    pub fn responding_after(mut self, bytes: usize) -> Self {
        self.respond_at = bytes;
        self
    }

    /// Decide how many of the delivered bytes to consume.
    pub fn consuming(mut self, policy: impl FnMut(&[u8]) -> usize + Send + 'static) -> Self {
        self.consume = Box::new(policy);
        self
    }

    pub fn closing_on_message(mut self) -> Self {
        self.close_on_message = true;
        self
    }
}

impl Delegate for RecordingDelegate {
    fn on_connect(&mut self, connection: &mut Connection) {
        self.log.push(DelegateEvent::Connect(connection.id()));
    }

    fn on_message(&mut self, delivery: &mut DeliveryGuard<'_>, connection: &mut Connection) {
        let data = delivery.data();
        self.log
            .push(DelegateEvent::Message(connection.id(), data.to_vec()));

        if let Some(response) = &self.handshake_response {
            if !connection.is_handshaked() && data.len() >= self.respond_at {
                let _ = connection.send(response.clone());
            }
        }

        let n = (self.consume)(data);
        delivery.consume(n);

        if self.close_on_message {
            connection.request_close();
        }
    }

    fn on_close(&mut self, connection: &Connection) {
        self.log.push(DelegateEvent::Close(connection.id()));
    }
}
