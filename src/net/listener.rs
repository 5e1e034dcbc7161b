//! TCP listener feeding the connection engine.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections on a background task
//! - Hand each socket to a [`TcpTransport`] and report it through the
//!   accept notifier
//!
//! Admission control is the server's job: this listener accepts everything
//! and the server drops what it cannot take.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::io::{AcceptNotifier, IoStatus, Listener, Transport};
use super::tcp::TcpTransport;
use crate::config::ListenerConfig;
use crate::error::NetError;

/// Pause after an accept failure that is not about a single connection.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Why the listener could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid bind address {address:?}: {source}")]
    Address {
        address: String,
        source: std::net::AddrParseError,
    },
    #[error("cannot bind {address}: {source}")]
    Bind { address: SocketAddr, source: io::Error },
}

/// Tokio TCP listener behind the engine's [`Listener`] trait.
pub struct TcpAcceptor {
    inner: Arc<TcpListener>,
    local_addr: SocketAddr,
    pending: Option<JoinHandle<()>>,
}

impl TcpAcceptor {
    /// Bind to the configured address.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let address: SocketAddr = config.bind_address.parse().map_err(|source| {
            ListenerError::Address {
                address: config.bind_address.clone(),
                source,
            }
        })?;

        let bind_error = |source| ListenerError::Bind { address, source };
        let listener = TcpListener::bind(address).await.map_err(bind_error)?;
        let acceptor = Self::from_listener(listener).map_err(bind_error)?;

        tracing::info!(
            address = %acceptor.local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );
        Ok(acceptor)
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Arc::new(listener),
            local_addr,
            pending: None,
        })
    }
}

impl Listener for TcpAcceptor {
    fn accept(&mut self, notifier: AcceptNotifier) -> IoStatus<Box<dyn Transport>> {
        let listener = Arc::clone(&self.inner);
        self.pending = Some(tokio::spawn(async move {
            let result = match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(peer_addr = %peer, "TCP connection accepted");
                    Ok(Box::new(TcpTransport::spawn(stream)) as Box<dyn Transport>)
                }
                Err(e) => {
                    // Out of descriptors or buffers: give the process a moment
                    // before the server re-arms, or it would spin on the error.
                    if !is_connection_error(&e) {
                        tracing::error!(
                            error = %e,
                            backoff_ms = ACCEPT_ERROR_BACKOFF.as_millis() as u64,
                            "Accept failed, backing off"
                        );
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                    Err(NetError::Io(e))
                }
            };
            notifier.accepted(result);
        }));
        IoStatus::Pending
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Errors that concern one incoming connection rather than the listener.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}
