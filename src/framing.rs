//! Frame-splitting delegate bundled with the binary.
//!
//! Recognizes the two record layouts a client sends: TPKT (version byte 3,
//! big-endian length at bytes 2..4) and fast-path (length in one or two
//! bytes after the action byte). Only complete frames are consumed; a
//! partial tail stays buffered for the next read.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::server::{Connection, Delegate, DeliveryGuard};

pub const TPKT_VERSION: u8 = 3;
pub const TPKT_HEADER_LEN: usize = 4;

/// Connection confirm selecting TLS, sent in answer to the first request.
pub static CONNECTION_CONFIRM: [u8; 19] = [
    0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, 0x08, 0x00,
    0x01, 0x00, 0x00, 0x00,
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unsupported TPKT version {0}")]
    Version(u8),
    #[error("frame length {0} shorter than its header")]
    Length(usize),
}

/// Length of the first complete frame in `data`.
///
/// `Ok(None)` until enough bytes have arrived.
pub fn frame_len(data: &[u8]) -> Result<Option<usize>, FrameError> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };

    let (header, len) = if first & 0x03 == 0 {
        // Fast-path: the action bits are zero.
        match data {
            [_, b1, ..] if b1 & 0x80 == 0 => (2, usize::from(*b1)),
            [_, b1, b2, ..] => (3, usize::from(b1 & 0x7f) << 8 | usize::from(*b2)),
            _ => return Ok(None),
        }
    } else {
        if first != TPKT_VERSION {
            return Err(FrameError::Version(first));
        }
        if data.len() < TPKT_HEADER_LEN {
            return Ok(None);
        }
        (
            TPKT_HEADER_LEN,
            usize::from(u16::from_be_bytes([data[2], data[3]])),
        )
    };

    if len < header {
        return Err(FrameError::Length(len));
    }
    Ok((data.len() >= len).then_some(len))
}

/// Answers the connection request and consumes whole frames afterwards.
#[derive(Debug, Default)]
pub struct FramingDelegate {
    idle_timeout: Option<Duration>,
}

impl FramingDelegate {
    /// `idle_timeout` of `None` never arms a disconnect deadline.
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self { idle_timeout }
    }

    fn refresh_deadline(&self, connection: &mut Connection) {
        if let Some(timeout) = self.idle_timeout {
            connection.set_disconnect_deadline(Some(Instant::now() + timeout));
        }
    }
}

impl Delegate for FramingDelegate {
    fn on_connect(&mut self, connection: &mut Connection) {
        self.refresh_deadline(connection);
    }

    fn on_message(&mut self, delivery: &mut DeliveryGuard<'_>, connection: &mut Connection) {
        loop {
            let len = match frame_len(delivery.remaining()) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %connection.id(), error = %e, "Malformed frame");
                    connection.request_close();
                    return;
                }
            };

            if connection.is_handshaked() {
                tracing::trace!(connection_id = %connection.id(), len, "Frame received");
            } else {
                tracing::debug!(connection_id = %connection.id(), len, "Connection request received");
                if let Err(e) = connection.send(Bytes::from_static(&CONNECTION_CONFIRM)) {
                    tracing::warn!(connection_id = %connection.id(), error = %e, "Failed to queue connection confirm");
                    return;
                }
            }

            delivery.consume(len);
            self.refresh_deadline(connection);
        }
    }

    fn on_close(&mut self, connection: &Connection) {
        tracing::info!(
            connection_id = %connection.id(),
            lifetime_ms = connection.created_at().elapsed().as_millis() as u64,
            handshaked = connection.is_handshaked(),
            "Session ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Completion, Event, ManualQueue};
    use crate::server::{ConnectionId, Server, ServerSettings};
    use crate::testing::{ListenerProbe, ReadStep, ScriptedTls, TransportProbe};
    use std::sync::Arc;

    const REQUEST: [u8; 19] = [
        0x03, 0x00, 0x00, 0x13, 0x0e, 0xe0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0x00,
        0x03, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn tpkt_length_needs_full_header_and_body() {
        assert_eq!(frame_len(&[]), Ok(None));
        assert_eq!(frame_len(&REQUEST[..3]), Ok(None));
        assert_eq!(frame_len(&REQUEST[..18]), Ok(None));
        assert_eq!(frame_len(&REQUEST), Ok(Some(19)));
        assert_eq!(frame_len(&[REQUEST.as_slice(), &[0x03]].concat()), Ok(Some(19)));
    }

    #[test]
    fn fast_path_lengths() {
        assert_eq!(frame_len(&[0x00, 0x03, 0xaa]), Ok(Some(3)));
        assert_eq!(frame_len(&[0x00, 0x05, 0xaa]), Ok(None));
        let mut long = vec![0x04, 0x81, 0x02];
        long.resize(0x102, 0);
        assert_eq!(frame_len(&long), Ok(Some(0x102)));
    }

    #[test]
    fn malformed_headers() {
        assert_eq!(frame_len(&[0x05, 0, 0, 4]), Err(FrameError::Version(5)));
        assert_eq!(frame_len(&[0x03, 0, 0, 2]), Err(FrameError::Length(2)));
        assert_eq!(frame_len(&[0x00, 0x01]), Err(FrameError::Length(1)));
    }

    #[test]
    fn split_request_is_answered_once_complete() {
        let queue = ManualQueue::new();
        let listener = ListenerProbe::new();
        let probe = TransportProbe::new();
        probe.push_read(ReadStep::Data(REQUEST[..7].to_vec()));
        probe.push_read(ReadStep::Data(REQUEST[7..].to_vec()));
        listener.push(probe.transport());

        let mut server = Server::new(
            listener.listener(),
            Box::new(ScriptedTls::new()),
            Box::new(FramingDelegate::new(Some(Duration::from_secs(30)))),
            Arc::new(queue.clone()),
            ServerSettings::default(),
        );
        while let Some(event) = queue.pop() {
            server.handle_event(event);
        }

        let id = ConnectionId::new(1);
        assert_eq!(probe.written(), CONNECTION_CONFIRM);
        let status = server.registry().get(id).unwrap();
        assert!(status.is_handshaked());

        // One whole frame plus the first byte of the next.
        let mut bytes = vec![0x00, 0x03, 0xaa];
        bytes.push(0x00);
        server.handle_event(Event::Io {
            id,
            completion: Completion::Read(Ok(Bytes::from(bytes))),
        });
        let deadline = server.with_connection(id, |c| c.disconnect_deadline()).unwrap();
        assert!(deadline.is_some());

        server.handle_event(Event::Io {
            id,
            completion: Completion::Read(Ok(Bytes::from_static(&[0x03, 0xbb]))),
        });
        assert!(server.registry().get(id).is_some());
        assert!(queue.is_empty());
        server.shutdown();
    }
}
