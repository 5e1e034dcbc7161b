//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::any::Any;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use rdp_listener::event::{event_channel, ManualQueue};
use rdp_listener::lifecycle::{EventLoop, Shutdown};
use rdp_listener::net::{
    IoStatus, Notifier, TcpAcceptor, TcpTransport, TlsContext, TlsTransport, Transport,
};
use rdp_listener::server::{Delegate, Server, ServerHandle, ServerSettings, SessionRegistry};
use rdp_listener::testing::{ListenerProbe, ScriptedTls};
use rdp_listener::NetError;

/// X.224 connection request asking for TLS.
pub const CONNECTION_REQUEST: [u8; 19] = [
    0x03, 0x00, 0x00, 0x13, 0x0e, 0xe0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0x00,
    0x03, 0x00, 0x00, 0x00,
];

/// TLS stand-in for TCP tests: the "handshake" succeeds at once and bytes
/// pass through unchanged.
pub struct PassthroughTls;

impl TlsContext for PassthroughTls {
    fn wrap(&self, raw: Box<dyn Transport>) -> Result<Box<dyn TlsTransport>, NetError> {
        let tcp = raw
            .into_any()
            .downcast::<TcpTransport>()
            .map_err(|_| NetError::Tls("expected a TCP transport".into()))?;
        Ok(Box::new(PassthroughTransport { inner: *tcp }))
    }
}

struct PassthroughTransport {
    inner: TcpTransport,
}

impl Transport for PassthroughTransport {
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

impl TlsTransport for PassthroughTransport {
    fn handshake(&mut self, notifier: Notifier) -> IoStatus<()> {
        notifier.handshake_completed(Ok(()));
        IoStatus::Pending
    }
}

/// A listener running on its own event loop.
pub struct RunningListener {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub registry: SessionRegistry,
    pub shutdown: Shutdown,
    pub task: JoinHandle<()>,
}

/// Bind to an ephemeral port and run a server with `delegate` behind
/// [`PassthroughTls`].
pub async fn start_listener(delegate: Box<dyn Delegate>, max_concurrent: usize) -> RunningListener {
    start_listener_with_tls(delegate, max_concurrent, Box::new(PassthroughTls)).await
}

/// Like [`start_listener`] with a caller-chosen TLS context.
pub async fn start_listener_with_tls(
    delegate: Box<dyn Delegate>,
    max_concurrent: usize,
    tls: Box<dyn TlsContext>,
) -> RunningListener {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let acceptor = TcpAcceptor::from_listener(listener).unwrap();
    let addr = rdp_listener::net::Listener::local_addr(&acceptor).unwrap();

    let (sink, events) = event_channel();
    let server = Server::new(
        Box::new(acceptor),
        tls,
        delegate,
        sink,
        ServerSettings {
            max_concurrent,
            ..ServerSettings::default()
        },
    );
    let event_loop = EventLoop::new(server, events, Duration::from_millis(20));
    let handle = event_loop.handle();
    let registry = event_loop.registry();

    let shutdown = Shutdown::new();
    let task = tokio::spawn(event_loop.run(shutdown.subscribe()));

    RunningListener {
        addr,
        handle,
        registry,
        shutdown,
        task,
    }
}

/// Path of a file under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// A server driven by hand from a [`ManualQueue`].
pub fn manual_server(
    delegate: Box<dyn Delegate>,
    settings: ServerSettings,
) -> (Server, ManualQueue, ListenerProbe) {
    let queue = ManualQueue::new();
    let listener = ListenerProbe::new();
    let server = Server::new(
        listener.listener(),
        Box::new(ScriptedTls::new()),
        delegate,
        Arc::new(queue.clone()),
        settings,
    );
    (server, queue, listener)
}

/// Handle queued events until the queue is empty.
pub fn pump(server: &mut Server, queue: &ManualQueue) {
    while let Some(event) = queue.pop() {
        server.handle_event(event);
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
