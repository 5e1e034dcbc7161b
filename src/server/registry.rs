//! Connection ids, shared status, and the locked connection map.
//!
//! # Responsibilities
//! - Assign the identity a connection keeps for its whole life
//! - Own every live [`Connection`] behind one mutex
//! - Answer read-only queries from any thread without touching connection
//!   internals
//!
//! # Design Decisions
//! - The lock is held only for map operations, never across delegate calls:
//!   the owner task checks a connection *out* of its slot while running it
//!   and checks it back in afterwards
//! - Queries read [`ConnectionStatus`], which stays in the slot while the
//!   connection itself is checked out

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use super::connection::Connection;

/// Identifier of a connection, unique while it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// The id after this one, wrapping past `u32::MAX` back to 1.
    pub(crate) fn next(self) -> Self {
        match self.0.checked_add(1) {
            Some(raw) => Self(raw),
            None => Self(1),
        }
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle facts about one connection, readable from any thread.
#[derive(Debug)]
pub struct ConnectionStatus {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    created_at: Instant,
    closing: AtomicBool,
    handshake_completed_at: OnceLock<Instant>,
    finished_at: OnceLock<Instant>,
}

impl ConnectionStatus {
    pub(crate) fn new(id: ConnectionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            created_at: Instant::now(),
            closing: AtomicBool::new(false),
            handshake_completed_at: OnceLock::new(),
            finished_at: OnceLock::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn handshake_completed_at(&self) -> Option<Instant> {
        self.handshake_completed_at.get().copied()
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshake_completed_at.get().is_some()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at.get().copied()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.get().is_some()
    }

    /// Returns `true` only for the call that flipped the flag.
    pub(crate) fn mark_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn record_handshake(&self, at: Instant) {
        assert!(
            self.handshake_completed_at.set(at).is_ok(),
            "{}: handshake completed twice",
            self.id
        );
    }

    pub(crate) fn record_finished(&self, at: Instant) {
        let handshaked = self
            .handshake_completed_at()
            .unwrap_or_else(|| panic!("{}: finished before the TLS handshake", self.id));
        assert!(
            at > handshaked,
            "{}: finish time precedes handshake completion",
            self.id
        );
        assert!(
            self.finished_at.set(at).is_ok(),
            "{}: finish time recorded twice",
            self.id
        );
    }
}

/// One map entry. `connection` is `None` while the owner task is running it.
pub(crate) struct Slot {
    pub(crate) status: Arc<ConnectionStatus>,
    pub(crate) connection: Option<Box<Connection>>,
}

/// Shared handle to the connection map.
///
/// Clones are cheap and may be handed to other threads for the read-only
/// queries; mutation is crate-private and happens on the owner task.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<BTreeMap<ConnectionId, Slot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Slot>> {
        self.slots.lock().expect("connection registry poisoned")
    }

    /// Registered connections, closing ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `id` still names a registered connection.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Status of `id` unless it is closing.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionStatus>> {
        self.lock()
            .get(&id)
            .filter(|slot| !slot.status.is_closing())
            .map(|slot| Arc::clone(&slot.status))
    }

    pub fn open_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| !slot.status.is_closing())
            .count()
    }

    pub fn first_open(&self) -> Option<Arc<ConnectionStatus>> {
        self.first_matching(|_| true)
    }

    pub fn first_handshaked(&self) -> Option<Arc<ConnectionStatus>> {
        self.first_matching(ConnectionStatus::is_handshaked)
    }

    pub fn first_finished(&self) -> Option<Arc<ConnectionStatus>> {
        self.first_matching(ConnectionStatus::is_finished)
    }

    /// Status of every open connection, in id order.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionStatus>> {
        self.lock()
            .values()
            .filter(|slot| !slot.status.is_closing())
            .map(|slot| Arc::clone(&slot.status))
            .collect()
    }

    fn first_matching(
        &self,
        predicate: impl Fn(&ConnectionStatus) -> bool,
    ) -> Option<Arc<ConnectionStatus>> {
        self.lock()
            .values()
            .find(|slot| !slot.status.is_closing() && predicate(&slot.status))
            .map(|slot| Arc::clone(&slot.status))
    }

    /// Register `status` with its connection already checked out.
    pub(crate) fn insert_checked_out(&self, status: Arc<ConnectionStatus>) {
        let previous = self.lock().insert(
            status.id(),
            Slot {
                status,
                connection: None,
            },
        );
        assert!(previous.is_none(), "connection id registered twice");
    }

    /// Take the connection out of its slot for the owner task to run.
    ///
    /// `None` if the id is unknown, closing, or already checked out.
    pub(crate) fn check_out(&self, id: ConnectionId) -> Option<Box<Connection>> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&id)?;
        if slot.status.is_closing() {
            return None;
        }
        slot.connection.take()
    }

    /// Put a checked-out connection back. Hands it back if its slot is gone.
    pub(crate) fn check_in(&self, connection: Box<Connection>) -> Result<(), Box<Connection>> {
        let mut slots = self.lock();
        match slots.get_mut(&connection.id()) {
            Some(slot) => {
                debug_assert!(slot.connection.is_none(), "slot already occupied");
                slot.connection = Some(connection);
                Ok(())
            }
            None => Err(connection),
        }
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Slot> {
        self.lock().remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<Slot> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }

    /// First open, resident connection whose disconnect deadline has passed.
    pub(crate) fn first_due(&self, now: Instant) -> Option<ConnectionId> {
        self.lock().iter().find_map(|(id, slot)| {
            let connection = slot.connection.as_ref()?;
            (!slot.status.is_closing() && connection.should_disconnect(now)).then_some(*id)
        })
    }
}
