//! The transport seam and an in-process transport.
//!
//! A [`Transport`] moves opaque frames between connections; it knows nothing
//! about packet types. Real deployments plug in a socket-backed transport.
//! [`MemoryHub`] connects any number of clients to one server inside a single
//! process over `crossbeam-channel`, which is what tests and integrated
//! sessions use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::flags::PacketFlags;
use crate::ids::ConnectionId;
use crate::protocol::IncomingFrame;
use crate::NetError;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Which side of a link a transport sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    /// One connection, to the server.
    Client,
    /// Any number of connections, one per client.
    Server,
}

/// Something that happened on the transport since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    Frame(IncomingFrame),
}

/// Frame-level link to remote peers.
///
/// Frames from one connection must be reported by [`poll`](Self::poll) in
/// the order that connection delivered them.
pub trait Transport: Send {
    fn role(&self) -> TransportRole;

    /// Currently open connections.
    fn connections(&self) -> Vec<ConnectionId>;

    /// Queue `frame` for `to`.
    fn send(&mut self, to: ConnectionId, frame: Vec<u8>, flags: PacketFlags)
        -> Result<(), NetError>;

    /// Close a connection. A `Disconnected` event follows on the next poll.
    fn close_connection(&mut self, id: ConnectionId);

    /// Drain everything that arrived since the previous call.
    fn poll(&mut self) -> Vec<TransportEvent>;
}

// ---------------------------------------------------------------------------
// Memory transport
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Envelope {
    Connect {
        id: ConnectionId,
        inbox: Sender<Envelope>,
    },
    Frame {
        from: ConnectionId,
        bytes: Vec<u8>,
    },
    Close {
        id: ConnectionId,
    },
}

/// Factory for in-process client connections to one [`MemoryServerTransport`].
#[derive(Debug, Clone)]
pub struct MemoryHub {
    server_inbox: Sender<Envelope>,
    next_id: Arc<AtomicU32>,
}

impl MemoryHub {
    /// Create a hub and the server end it feeds.
    pub fn new() -> (MemoryHub, MemoryServerTransport) {
        let (tx, rx) = unbounded();
        let hub = MemoryHub {
            server_inbox: tx,
            next_id: Arc::new(AtomicU32::new(1)),
        };
        let server = MemoryServerTransport {
            inbox: rx,
            peers: BTreeMap::new(),
            pending: Vec::new(),
        };
        (hub, server)
    }

    /// Open a new client connection.
    ///
    /// The server sees `Connected` on its next poll; the client sees
    /// `Connected(ConnectionId::SERVER)` on its first poll, or `Disconnected`
    /// if the server is already gone.
    pub fn connect(&self) -> MemoryClientTransport {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = unbounded();
        let connected = self
            .server_inbox
            .send(Envelope::Connect { id, inbox: tx })
            .is_ok();
        let first_event = if connected {
            TransportEvent::Connected(ConnectionId::SERVER)
        } else {
            TransportEvent::Disconnected(ConnectionId::SERVER)
        };
        MemoryClientTransport {
            id,
            server: self.server_inbox.clone(),
            inbox: rx,
            connected,
            pending: vec![first_event],
        }
    }
}

/// Server end of a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryServerTransport {
    inbox: Receiver<Envelope>,
    peers: BTreeMap<ConnectionId, Sender<Envelope>>,
    pending: Vec<TransportEvent>,
}

impl Transport for MemoryServerTransport {
    fn role(&self) -> TransportRole {
        TransportRole::Server
    }

    fn connections(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }

    fn send(
        &mut self,
        to: ConnectionId,
        frame: Vec<u8>,
        _flags: PacketFlags,
    ) -> Result<(), NetError> {
        let peer = self.peers.get(&to).ok_or(NetError::UnknownConnection(to))?;
        let delivered = peer
            .send(Envelope::Frame {
                from: ConnectionId::SERVER,
                bytes: frame,
            })
            .is_ok();
        if delivered {
            Ok(())
        } else {
            self.peers.remove(&to);
            self.pending.push(TransportEvent::Disconnected(to));
            Err(NetError::ConnectionClosed(to))
        }
    }

    fn close_connection(&mut self, id: ConnectionId) {
        if let Some(peer) = self.peers.remove(&id) {
            let _ = peer.send(Envelope::Close { id });
            self.pending.push(TransportEvent::Disconnected(id));
            debug!(connection = %id, "memory transport closed connection");
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = std::mem::take(&mut self.pending);
        while let Ok(envelope) = self.inbox.try_recv() {
            match envelope {
                Envelope::Connect { id, inbox } => {
                    self.peers.insert(id, inbox);
                    info!(connection = %id, "memory transport accepted connection");
                    events.push(TransportEvent::Connected(id));
                }
                Envelope::Frame { from, bytes } => {
                    // Frames from a connection we already closed are stale.
                    if self.peers.contains_key(&from) {
                        events.push(TransportEvent::Frame(IncomingFrame {
                            source: from,
                            bytes,
                        }));
                    }
                }
                Envelope::Close { id } => {
                    if self.peers.remove(&id).is_some() {
                        events.push(TransportEvent::Disconnected(id));
                    }
                }
            }
        }
        events
    }
}

/// Client end of a [`MemoryHub`]. Dropping it disconnects.
#[derive(Debug)]
pub struct MemoryClientTransport {
    id: ConnectionId,
    server: Sender<Envelope>,
    inbox: Receiver<Envelope>,
    connected: bool,
    pending: Vec<TransportEvent>,
}

impl MemoryClientTransport {
    /// The id the server knows this client by.
    pub fn server_side_id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn mark_disconnected(&mut self, events: &mut Vec<TransportEvent>) {
        if self.connected {
            self.connected = false;
            events.push(TransportEvent::Disconnected(ConnectionId::SERVER));
        }
    }
}

impl Transport for MemoryClientTransport {
    fn role(&self) -> TransportRole {
        TransportRole::Client
    }

    fn connections(&self) -> Vec<ConnectionId> {
        if self.connected {
            vec![ConnectionId::SERVER]
        } else {
            Vec::new()
        }
    }

    fn send(
        &mut self,
        to: ConnectionId,
        frame: Vec<u8>,
        _flags: PacketFlags,
    ) -> Result<(), NetError> {
        if to != ConnectionId::SERVER {
            return Err(NetError::UnknownConnection(to));
        }
        if !self.connected {
            return Err(NetError::ConnectionClosed(to));
        }
        self.server
            .send(Envelope::Frame {
                from: self.id,
                bytes: frame,
            })
            .map_err(|_| NetError::ConnectionClosed(to))
    }

    fn close_connection(&mut self, id: ConnectionId) {
        if id == ConnectionId::SERVER && self.connected {
            let _ = self.server.send(Envelope::Close { id: self.id });
            let mut events = Vec::new();
            self.mark_disconnected(&mut events);
            self.pending.extend(events);
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = std::mem::take(&mut self.pending);
        loop {
            match self.inbox.try_recv() {
                Ok(Envelope::Frame { from, bytes }) => {
                    if self.connected {
                        events.push(TransportEvent::Frame(IncomingFrame { source: from, bytes }));
                    }
                }
                Ok(Envelope::Close { .. }) => self.mark_disconnected(&mut events),
                Ok(Envelope::Connect { .. }) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.mark_disconnected(&mut events);
                    break;
                }
            }
        }
        events
    }
}

impl Drop for MemoryClientTransport {
    fn drop(&mut self) {
        if self.connected {
            let _ = self.server.send(Envelope::Close { id: self.id });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_send_and_receive_in_order() {
        let (hub, mut server) = MemoryHub::new();
        let mut client = hub.connect();

        assert_eq!(
            client.poll(),
            vec![TransportEvent::Connected(ConnectionId::SERVER)]
        );
        let id = client.server_side_id();
        assert_eq!(server.poll(), vec![TransportEvent::Connected(id)]);

        for i in 0..3u8 {
            client
                .send(ConnectionId::SERVER, vec![i], PacketFlags::RELIABLE)
                .unwrap();
        }
        let frames: Vec<u8> = server
            .poll()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Frame(f) => {
                    assert_eq!(f.source, id);
                    Some(f.bytes[0])
                }
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![0, 1, 2]);

        server.send(id, vec![9], PacketFlags::RELIABLE).unwrap();
        assert_eq!(
            client.poll(),
            vec![TransportEvent::Frame(IncomingFrame {
                source: ConnectionId::SERVER,
                bytes: vec![9],
            })]
        );
    }

    #[test]
    fn server_close_reaches_client() {
        let (hub, mut server) = MemoryHub::new();
        let mut client = hub.connect();
        client.poll();
        server.poll();

        server.close_connection(client.server_side_id());
        assert_eq!(
            server.poll(),
            vec![TransportEvent::Disconnected(client.server_side_id())]
        );
        assert_eq!(
            client.poll(),
            vec![TransportEvent::Disconnected(ConnectionId::SERVER)]
        );
        assert!(server.connections().is_empty());
        assert!(client
            .send(ConnectionId::SERVER, vec![1], PacketFlags::RELIABLE)
            .is_err());
    }

    #[test]
    fn dropping_client_disconnects_it() {
        let (hub, mut server) = MemoryHub::new();
        let client = hub.connect();
        let id = client.server_side_id();
        drop(client);
        assert_eq!(
            server.poll(),
            vec![
                TransportEvent::Connected(id),
                TransportEvent::Disconnected(id)
            ]
        );
    }

    #[test]
    fn send_to_unknown_connection_fails() {
        let (_hub, mut server) = MemoryHub::new();
        assert!(matches!(
            server.send(ConnectionId(77), vec![], PacketFlags::RELIABLE),
            Err(NetError::UnknownConnection(_))
        ));
    }
}
