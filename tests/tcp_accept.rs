//! Listener tests over real loopback sockets.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use rdp_listener::net::RustlsContext;
use rdp_listener::server::ConnectionId;
use rdp_listener::testing::{DelegateLog, RecordingDelegate};

mod common;

const CONFIRM: &[u8] = b"\x03\x00\x00\x07\x02\xf0\x80";

/// Consumes nothing until a whole connection request is buffered, then
/// answers it once.
fn confirming_delegate(log: DelegateLog) -> RecordingDelegate {
    RecordingDelegate::new(log)
        .with_handshake_response(CONFIRM)
        .responding_after(common::CONNECTION_REQUEST.len())
        .consuming(|data| {
            if data.len() >= common::CONNECTION_REQUEST.len() {
                data.len()
            } else {
                0
            }
        })
}

async fn read_exact_within(stream: &mut (impl AsyncRead + Unpin), len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// Connect and complete the request/confirm exchange.
async fn connect_and_confirm(addr: std::net::SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&common::CONNECTION_REQUEST).await.unwrap();
    let confirm = read_exact_within(&mut client, CONFIRM.len()).await;
    assert_eq!(confirm, CONFIRM);
    client
}

/// The most recent delivery. Short payloads stay buffered, so each read
/// redelivers everything since the request.
fn last_message(log: &DelegateLog) -> Vec<u8> {
    log.messages().pop().unwrap_or_default()
}

#[tokio::test]
async fn test_request_confirm_then_payload() {
    let log = DelegateLog::default();
    let running = common::start_listener(Box::new(confirming_delegate(log.clone())), 1).await;

    let mut client = connect_and_confirm(running.addr).await;
    common::wait_for(|| running.registry.first_handshaked().is_some()).await;

    client.write_all(b"hello").await.unwrap();
    common::wait_for(|| last_message(&log) == b"hello").await;
    assert_eq!(log.connects(), vec![ConnectionId::new(1)]);

    running.shutdown.trigger();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_second_client_declined_at_capacity() {
    let log = DelegateLog::default();
    let running = common::start_listener(Box::new(confirming_delegate(log.clone())), 1).await;

    let _first = connect_and_confirm(running.addr).await;

    let mut second = TcpStream::connect(running.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .expect("declined client was left open");
    // Dropped without a reply: either a clean end of stream or a reset.
    assert!(matches!(result, Ok(0) | Err(_)));

    assert_eq!(log.connects(), vec![ConnectionId::new(1)]);
    assert_eq!(running.registry.len(), 1);

    running.shutdown.trigger();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_handle_send_reaches_client() {
    let log = DelegateLog::default();
    let running = common::start_listener(Box::new(confirming_delegate(log.clone())), 1).await;

    let mut client = connect_and_confirm(running.addr).await;
    common::wait_for(|| running.registry.first_handshaked().is_some()).await;

    running.handle.send(ConnectionId::new(1), &b"server push"[..]);
    let pushed = read_exact_within(&mut client, b"server push".len()).await;
    assert_eq!(pushed, b"server push");

    running.shutdown.trigger();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_client_hangup_closes_connection() {
    let log = DelegateLog::default();
    let running = common::start_listener(Box::new(confirming_delegate(log.clone())), 1).await;

    let client = connect_and_confirm(running.addr).await;
    common::wait_for(|| running.registry.first_handshaked().is_some()).await;
    drop(client);

    common::wait_for(|| log.closes() == vec![ConnectionId::new(1)]).await;
    common::wait_for(|| running.registry.is_empty()).await;

    // The slot is free again.
    let _next = connect_and_confirm(running.addr).await;
    common::wait_for(|| log.connects().len() == 2).await;
    assert_eq!(log.connects()[1], ConnectionId::new(2));

    running.shutdown.trigger();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let log = DelegateLog::default();
    let running = common::start_listener(Box::new(confirming_delegate(log.clone())), 1).await;

    let mut client = connect_and_confirm(running.addr).await;
    running.shutdown.trigger();
    running.task.await.unwrap();

    assert_eq!(log.closes(), vec![ConnectionId::new(1)]);
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("client still open after shutdown");
    assert!(matches!(result, Ok(0) | Err(_)));
}

/// Client config trusting only the test CA under `tests/fixtures`.
fn test_connector() -> TlsConnector {
    let mut reader = BufReader::new(File::open(common::fixture("ca.crt")).unwrap());
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_rustls_upgrade_after_confirm() {
    let tls = RustlsContext::from_pem_files(
        &common::fixture("server.crt"),
        &common::fixture("server.key"),
    )
    .unwrap();
    let log = DelegateLog::default();
    let running = common::start_listener_with_tls(
        Box::new(confirming_delegate(log.clone())),
        1,
        Box::new(tls),
    )
    .await;

    let client = connect_and_confirm(running.addr).await;
    let domain = ServerName::try_from("localhost").unwrap();
    let mut client = tokio::time::timeout(
        Duration::from_secs(5),
        test_connector().connect(domain, client),
    )
    .await
    .expect("TLS handshake timed out")
    .unwrap();

    common::wait_for(|| running.registry.first_handshaked().is_some()).await;

    // Client to server, decrypted before delivery.
    client.write_all(b"hello-pdu").await.unwrap();
    client.flush().await.unwrap();
    common::wait_for(|| last_message(&log) == b"hello-pdu").await;

    // Server to client, encrypted on the way out.
    running.handle.send(ConnectionId::new(1), &b"server-push"[..]);
    let pushed = read_exact_within(&mut client, b"server-push".len()).await;
    assert_eq!(pushed, b"server-push");

    assert_eq!(log.connects(), vec![ConnectionId::new(1)]);
    running.shutdown.trigger();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_failed_tls_handshake_closes_connection() {
    let tls = RustlsContext::from_pem_files(
        &common::fixture("server.crt"),
        &common::fixture("server.key"),
    )
    .unwrap();
    let log = DelegateLog::default();
    let running = common::start_listener_with_tls(
        Box::new(confirming_delegate(log.clone())),
        1,
        Box::new(tls),
    )
    .await;

    // Plaintext where a ClientHello belongs.
    let mut client = connect_and_confirm(running.addr).await;
    client.write_all(b"not a client hello at all").await.unwrap();

    common::wait_for(|| log.closes() == vec![ConnectionId::new(1)]).await;
    assert!(running.registry.first_handshaked().is_none());
    assert!(log.messages().iter().all(|m| m.as_slice() != b"not a client hello at all"));

    running.shutdown.trigger();
    running.task.await.unwrap();
}
