//! Connection and network identifiers.
//!
//! A [`ConnectionId`] is local to one machine: it names a live link as seen
//! by the transport. A [`NetworkId`] is meaningful across machines: it names a
//! replicated object or a peer and is assigned once by the authority.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ConnectionId
// ---------------------------------------------------------------------------

/// Transport-level handle for one connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// On a client, the single connection to the server.
    pub const SERVER: ConnectionId = ConnectionId(0);
    /// On an integrated client+server, the self-connection of the local player.
    pub const LOCAL: ConnectionId = ConnectionId(u32::MAX);

    /// Whether this is the integrated self-connection.
    #[inline]
    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "ConnectionId(local)")
        } else {
            write!(f, "ConnectionId({})", self.0)
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "conn#local")
        } else {
            write!(f, "conn#{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkId
// ---------------------------------------------------------------------------

/// Stable cross-machine identifier.
///
/// Zero is never handed out by [`NetworkIdAllocator`], so it can stand in for
/// "none" on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub u32);

impl NetworkId {
    /// Wire placeholder for an absent id.
    pub const NONE: NetworkId = NetworkId(0);

    /// Whether this is the wire placeholder.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// `None` for the placeholder, `Some(self)` otherwise.
    #[inline]
    pub fn into_option(self) -> Option<NetworkId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({})", self.0)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// NetworkIdAllocator
// ---------------------------------------------------------------------------

/// Monotonic network id source.
///
/// Ids are never recycled, which trivially guarantees that no live object
/// shares an id with another one.
#[derive(Debug)]
pub struct NetworkIdAllocator {
    next: u32,
}

impl NetworkIdAllocator {
    /// Create an allocator whose first id is `1`.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Hand out the next id.
    ///
    /// # Panics
    ///
    /// Panics if the 32-bit id space is exhausted.
    pub fn allocate(&mut self) -> NetworkId {
        let id = self.next;
        self.next = self
            .next
            .checked_add(1)
            .expect("network id space exhausted");
        NetworkId(id)
    }

    /// Make sure future ids are strictly greater than `seen`.
    ///
    /// Used when an authority takes over objects created elsewhere.
    pub fn observe(&mut self, seen: NetworkId) {
        if seen.0 >= self.next {
            self.next = seen.0.saturating_add(1);
        }
    }
}

impl Default for NetworkIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
