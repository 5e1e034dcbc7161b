//! The embedder's side of the engine.

use super::connection::Connection;

/// Receives connection lifecycle events and decrypted application bytes.
///
/// All methods run on the owner task. It is not safe to tear down the
/// server from inside any of them; ask the connection to close instead
/// ([`Connection::request_close`]).
pub trait Delegate: Send {
    /// A connection was accepted and is about to read its handshake request.
    fn on_connect(&mut self, _connection: &mut Connection) {}

    /// Bytes arrived. Report how much was used through `delivery`; the rest
    /// is presented again, followed by the next read's bytes.
    fn on_message(&mut self, delivery: &mut DeliveryGuard<'_>, connection: &mut Connection);

    /// Called exactly once for every connection that saw `on_connect`.
    fn on_close(&mut self, _connection: &Connection) {}
}

/// The single window through which one read result reaches the delegate.
///
/// It exists only for the duration of one `on_message` call. Consumption is
/// tracked as an offset from the start of `data`.
#[derive(Debug)]
pub struct DeliveryGuard<'a> {
    data: &'a [u8],
    consumed: usize,
}

impl<'a> DeliveryGuard<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, consumed: 0 }
    }

    /// Everything delivered, including bytes already consumed.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.consumed..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Mark `n` more bytes as used.
    ///
    /// # Panics
    /// If that would run past the delivered data.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.data.len() - self.consumed,
            "consumed past the end of the delivered bytes"
        );
        self.consumed += n;
    }

    /// Copy unconsumed bytes into `out`, consuming what was copied.
    ///
    /// Lets a pull-style parser drain the delivery the way it would read a
    /// socket.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let remaining = self.remaining();
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.consumed += n;
        n
    }
}
