//! Startup orchestration.
//!
//! # Responsibilities
//! - Load the TLS context
//! - Bind the listener
//! - Build the server and its event loop
//!
//! # Design Decisions
//! - Fail fast: a missing certificate or unbindable address is fatal
//! - TLS loads before binding, so a bad certificate never opens the port

use std::path::Path;
use std::time::Duration;

use crate::config::GatewayConfig;
use crate::event::event_channel;
use crate::net::{ListenerError, RustlsContext, TcpAcceptor};
use crate::server::{Delegate, Server, ServerSettings};

use super::runtime::EventLoop;

/// Why the listener could not start.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("TLS setup failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Build a ready-to-run event loop for `config`.
pub async fn start(
    config: &GatewayConfig,
    delegate: Box<dyn Delegate>,
) -> Result<EventLoop, StartupError> {
    let tls = RustlsContext::from_pem_files(
        Path::new(&config.tls.cert_path),
        Path::new(&config.tls.key_path),
    )
    .map_err(StartupError::Tls)?;

    let listener = TcpAcceptor::bind(&config.listener).await?;

    let (sink, events) = event_channel();
    let settings = ServerSettings::from(config);
    tracing::info!(
        max_connections = settings.max_concurrent,
        max_write_buffer_bytes = settings.connection.max_write_buffer_bytes,
        read_buffer_max_bytes = settings.connection.read_buffer.max,
        "Server configured"
    );

    let server = Server::new(
        Box::new(listener),
        Box::new(tls),
        delegate,
        sink,
        settings,
    );
    Ok(EventLoop::new(
        server,
        events,
        Duration::from_millis(config.keepalive.sweep_interval_ms),
    ))
}
