//! Tokio-backed transports.
//!
//! # Responsibilities
//! - Own one accepted socket per spawned I/O task
//! - Turn `read`/`write`/`handshake` calls into commands for that task
//! - Report each finished command through the caller's [`Notifier`]
//!
//! # Design Decisions
//! - Calls never block: every operation returns [`IoStatus::Pending`] and
//!   completes on the owner task's queue
//! - Reads and writes run concurrently; the task only races cancel-safe
//!   futures against new commands
//! - Dropping the transport ends the task and closes the socket

use std::any::Any;
use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use super::io::{IoStatus, Notifier, TlsTransport, Transport};
use crate::error::NetError;

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type BoxedIo = Box<dyn Io>;

enum Command {
    Read { max: usize, notifier: Notifier },
    Write { data: Bytes, notifier: Notifier },
    Handshake { acceptor: TlsAcceptor, notifier: Notifier },
}

/// Plaintext TCP transport.
pub struct TcpTransport {
    commands: mpsc::UnboundedSender<Command>,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Hand `stream` to a new I/O task. Must be called inside a runtime.
    pub fn spawn(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(Box::new(stream), rx));
        Self { commands, peer }
    }

    fn submit<T>(&self, command: Command) -> IoStatus<T> {
        match self.commands.send(command) {
            Ok(()) => IoStatus::Pending,
            // The task exits only after the socket failed or closed.
            Err(_) => IoStatus::Ready(Err(NetError::ConnectionClosed)),
        }
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], notifier: Notifier) -> IoStatus<usize> {
        self.submit(Command::Read {
            max: buf.len(),
            notifier,
        })
    }

    fn write(&mut self, buf: &[u8], notifier: Notifier) -> IoStatus<usize> {
        self.submit(Command::Write {
            data: Bytes::copy_from_slice(buf),
            notifier,
        })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// TCP transport whose I/O task terminates TLS with rustls.
pub struct TlsTcpTransport {
    inner: TcpTransport,
    acceptor: TlsAcceptor,
}

impl TlsTcpTransport {
    pub fn new(inner: TcpTransport, acceptor: TlsAcceptor) -> Self {
        Self { inner, acceptor }
    }
}

impl Transport for TlsTcpTransport {
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

impl TlsTransport for TlsTcpTransport {
    fn handshake(&mut self, notifier: Notifier) -> IoStatus<()> {
        self.inner.submit(Command::Handshake {
            acceptor: self.acceptor.clone(),
            notifier,
        })
    }
}

async fn drive(io: BoxedIo, mut commands: mpsc::UnboundedReceiver<Command>) {
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut read: Option<(usize, Notifier)> = None;
    let mut write: Option<(Bytes, Notifier)> = None;

    loop {
        let read_max = read.as_ref().map_or(0, |(max, _)| *max);
        let write_data = write.as_ref().map(|(data, _)| data.clone()).unwrap_or_default();
        let mut handshake = None;

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Read { max, notifier }) => {
                    debug_assert!(read.is_none(), "overlapping reads");
                    read = Some((max, notifier));
                }
                Some(Command::Write { data, notifier }) => {
                    debug_assert!(write.is_none(), "overlapping writes");
                    write = Some((data, notifier));
                }
                Some(Command::Handshake { acceptor, notifier }) => {
                    handshake = Some((acceptor, notifier));
                }
                None => break,
            },
            result = fill(&mut reader, read_max), if read.is_some() => {
                if let Some((_, notifier)) = read.take() {
                    notifier.read_completed(result.map_err(NetError::from));
                }
            }
            result = writer.write(&write_data), if write.is_some() => {
                let result = match result {
                    Ok(n) => writer.flush().await.map(|()| n),
                    Err(e) => Err(e),
                };
                if let Some((_, notifier)) = write.take() {
                    notifier.write_completed(result.map_err(NetError::from));
                }
            }
        }

        if let Some((acceptor, notifier)) = handshake {
            let stream = reader.unsplit(writer);
            match acceptor.accept(stream).await {
                Ok(tls) => {
                    notifier.handshake_completed(Ok(()));
                    (reader, writer) = tokio::io::split(Box::new(tls) as BoxedIo);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "TLS handshake failed");
                    notifier.handshake_completed(Err(handshake_error(e)));
                    return;
                }
            }
        }
    }
}

/// Read once into a fresh buffer of `max` bytes; empty means end of stream.
async fn fill(reader: &mut ReadHalf<BoxedIo>, max: usize) -> io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(max);
    let n = reader.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf.freeze())
}

fn handshake_error(err: io::Error) -> NetError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
        _ => NetError::Tls(err.to_string()),
    }
}
