//! The game-thread facing network interface.
//!
//! [`NetworkInterface`] wraps a [`Transport`] with the packet [`Protocol`]
//! and exposes the typed send primitives: `send_to_server`, `send`,
//! `send_to` and `broadcast`. It also keeps the [`PeerDirectory`] that maps
//! connections to the network ids peers are known by.
//!
//! An `Integrated` interface is a server that also hosts a local player.
//! The local player is addressed as [`ConnectionId::LOCAL`]: its
//! `send_to_server` frames come back out of the next [`poll`] as if they had
//! arrived from `LOCAL`, and frames the server sends to `LOCAL` are collected
//! by [`take_local_frames`].
//!
//! [`poll`]: NetworkInterface::poll
//! [`take_local_frames`]: NetworkInterface::take_local_frames

use std::collections::{BTreeMap, VecDeque};

use tracing::{info, warn};

use crate::ids::{ConnectionId, NetworkId, NetworkIdAllocator};
use crate::protocol::{IncomingFrame, Packet, Protocol};
use crate::transport::{Transport, TransportEvent, TransportRole};
use crate::NetError;

// ---------------------------------------------------------------------------
// NetRole / NetEvent
// ---------------------------------------------------------------------------

/// What this process is on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetRole {
    Client,
    Server,
    /// A server with a local player on [`ConnectionId::LOCAL`].
    Integrated,
}

impl NetRole {
    fn is_server(self) -> bool {
        matches!(self, NetRole::Server | NetRole::Integrated)
    }
}

/// Something the game thread must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// A peer connected. Servers assign it a network id.
    PeerConnected {
        connection: ConnectionId,
        network_id: Option<NetworkId>,
    },
    /// A peer went away. Its network id is released.
    PeerDisconnected {
        connection: ConnectionId,
        network_id: Option<NetworkId>,
    },
    /// A frame arrived; decode it with the protocol or a dispatcher.
    Frame(IncomingFrame),
}

// ---------------------------------------------------------------------------
// PeerDirectory
// ---------------------------------------------------------------------------

/// Two-way map between connections and peer network ids.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    by_connection: BTreeMap<ConnectionId, NetworkId>,
    by_network: BTreeMap<NetworkId, ConnectionId>,
    allocator: NetworkIdAllocator,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `connection` a fresh network id, or return the one it has.
    pub fn assign(&mut self, connection: ConnectionId) -> NetworkId {
        if let Some(id) = self.by_connection.get(&connection) {
            return *id;
        }
        let id = self.allocator.allocate();
        self.by_connection.insert(connection, id);
        self.by_network.insert(id, connection);
        id
    }

    /// Forget `connection`. Its network id is never handed out again.
    pub fn release(&mut self, connection: ConnectionId) -> Option<NetworkId> {
        let id = self.by_connection.remove(&connection)?;
        self.by_network.remove(&id);
        Some(id)
    }

    pub fn connection_for(&self, network_id: NetworkId) -> Option<ConnectionId> {
        self.by_network.get(&network_id).copied()
    }

    pub fn network_id_for(&self, connection: ConnectionId) -> Option<NetworkId> {
        self.by_connection.get(&connection).copied()
    }

    pub fn len(&self) -> usize {
        self.by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PacketSink
// ---------------------------------------------------------------------------

/// Where finished packets go. Implemented by [`NetworkInterface`]; tests
/// substitute recorders.
pub trait PacketSink {
    /// Directed send to one connection.
    fn send_packet<P: Packet>(&mut self, to: ConnectionId, packet: &P) -> Result<(), NetError>;

    /// Send to every connected peer not in `except`. Returns how many peers
    /// the packet was handed to.
    fn broadcast_packet<P: Packet>(
        &mut self,
        packet: &P,
        except: &[ConnectionId],
    ) -> Result<usize, NetError>;
}

// ---------------------------------------------------------------------------
// NetworkInterface
// ---------------------------------------------------------------------------

/// Typed send/receive over a transport.
pub struct NetworkInterface {
    role: NetRole,
    transport: Box<dyn Transport>,
    protocol: Protocol,
    peers: PeerDirectory,
    local_open: bool,
    /// Frames the local player sent to the server.
    loopback: VecDeque<IncomingFrame>,
    /// Frames the server sent to the local player.
    local_inbox: VecDeque<IncomingFrame>,
    pending: Vec<NetEvent>,
}

impl NetworkInterface {
    /// Wrap `transport`.
    ///
    /// # Panics
    ///
    /// Panics if a `Client` interface is given a server transport or the
    /// other way round.
    pub fn new(role: NetRole, transport: Box<dyn Transport>, protocol: Protocol) -> Self {
        let expected = if role.is_server() {
            TransportRole::Server
        } else {
            TransportRole::Client
        };
        assert_eq!(
            transport.role(),
            expected,
            "a {role:?} interface needs a {expected:?} transport"
        );

        let mut peers = PeerDirectory::new();
        let mut pending = Vec::new();
        let local_open = role == NetRole::Integrated;
        if local_open {
            let network_id = peers.assign(ConnectionId::LOCAL);
            pending.push(NetEvent::PeerConnected {
                connection: ConnectionId::LOCAL,
                network_id: Some(network_id),
            });
        }

        Self {
            role,
            transport,
            protocol,
            peers,
            local_open,
            loopback: VecDeque::new(),
            local_inbox: VecDeque::new(),
            pending,
        }
    }

    pub fn role(&self) -> NetRole {
        self.role
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Open connections, including `LOCAL` on an integrated interface.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut connections = self.transport.connections();
        if self.local_open {
            connections.push(ConnectionId::LOCAL);
        }
        connections
    }

    pub fn connection_for(&self, network_id: NetworkId) -> Option<ConnectionId> {
        self.peers.connection_for(network_id)
    }

    pub fn network_id_for(&self, connection: ConnectionId) -> Option<NetworkId> {
        self.peers.network_id_for(connection)
    }

    /// Close a connection. `PeerDisconnected` follows on the next poll.
    pub fn close_connection(&mut self, connection: ConnectionId) {
        if connection.is_local() {
            if self.local_open {
                self.local_open = false;
                let network_id = self.peers.release(connection);
                self.pending.push(NetEvent::PeerDisconnected {
                    connection,
                    network_id,
                });
            }
            return;
        }
        self.transport.close_connection(connection);
    }

    /// Send to the server. On an integrated interface the frame is handled
    /// by this same process on the next poll.
    pub fn send_to_server<P: Packet>(&mut self, packet: &P) -> Result<(), NetError> {
        match self.role {
            NetRole::Server => Err(NetError::WrongRole {
                operation: "send_to_server",
                role: self.role,
            }),
            NetRole::Client => {
                let frame = self.protocol.encode(packet)?;
                self.transport
                    .send(ConnectionId::SERVER, frame, packet.flags())
            }
            NetRole::Integrated => {
                let frame = self.protocol.encode(packet)?;
                if self.local_open {
                    self.loopback.push_back(IncomingFrame {
                        source: ConnectionId::LOCAL,
                        bytes: frame,
                    });
                }
                Ok(())
            }
        }
    }

    /// Directed send to one client.
    pub fn send<P: Packet>(&mut self, to: ConnectionId, packet: &P) -> Result<(), NetError> {
        if !self.role.is_server() {
            return Err(NetError::WrongRole {
                operation: "send",
                role: self.role,
            });
        }
        let frame = self.protocol.encode(packet)?;
        if to.is_local() {
            if !self.local_open {
                return Err(NetError::ConnectionClosed(to));
            }
            self.local_inbox.push_back(IncomingFrame {
                source: ConnectionId::SERVER,
                bytes: frame,
            });
            return Ok(());
        }
        self.transport.send(to, frame, packet.flags())
    }

    /// Directed send to the peer known as `network_id`.
    ///
    /// Returns `Ok(false)` and logs when no connected peer has that id.
    pub fn send_to<P: Packet>(
        &mut self,
        network_id: NetworkId,
        packet: &P,
    ) -> Result<bool, NetError> {
        match self.peers.connection_for(network_id) {
            Some(connection) => {
                self.send(connection, packet)?;
                Ok(true)
            }
            None => {
                warn!(
                    network_id = %network_id,
                    packet = P::NAME,
                    "send_to unknown network id, dropping packet"
                );
                Ok(false)
            }
        }
    }

    /// Send to every remote peer not in `except`.
    ///
    /// The local player of an integrated interface shares the server's state
    /// and is never broadcast to.
    pub fn broadcast<P: Packet>(
        &mut self,
        packet: &P,
        except: &[ConnectionId],
    ) -> Result<usize, NetError> {
        if !self.role.is_server() {
            return Err(NetError::WrongRole {
                operation: "broadcast",
                role: self.role,
            });
        }
        let frame = self.protocol.encode(packet)?;
        let flags = packet.flags();
        let mut sent = 0;
        for connection in self.transport.connections() {
            if except.contains(&connection) {
                continue;
            }
            match self.transport.send(connection, frame.clone(), flags) {
                Ok(()) => sent += 1,
                Err(NetError::ConnectionClosed(_)) | Err(NetError::UnknownConnection(_)) => {
                    // The disconnect surfaces on the next poll.
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Drain transport events, translating connects and disconnects into
    /// peer events and passing frames through in arrival order.
    pub fn poll(&mut self) -> Vec<NetEvent> {
        let mut events = std::mem::take(&mut self.pending);
        for event in self.transport.poll() {
            match event {
                TransportEvent::Connected(connection) => {
                    let network_id = self.role.is_server().then(|| self.peers.assign(connection));
                    info!(connection = %connection, ?network_id, "peer connected");
                    events.push(NetEvent::PeerConnected {
                        connection,
                        network_id,
                    });
                }
                TransportEvent::Disconnected(connection) => {
                    let network_id = self.peers.release(connection);
                    info!(connection = %connection, ?network_id, "peer disconnected");
                    events.push(NetEvent::PeerDisconnected {
                        connection,
                        network_id,
                    });
                }
                TransportEvent::Frame(frame) => events.push(NetEvent::Frame(frame)),
            }
        }
        events.extend(self.loopback.drain(..).map(NetEvent::Frame));
        events
    }

    /// Frames the server sent to the local player since the last call.
    pub fn take_local_frames(&mut self) -> Vec<IncomingFrame> {
        self.local_inbox.drain(..).collect()
    }
}

impl PacketSink for NetworkInterface {
    fn send_packet<P: Packet>(&mut self, to: ConnectionId, packet: &P) -> Result<(), NetError> {
        if to == ConnectionId::SERVER {
            self.send_to_server(packet)
        } else {
            self.send(to, packet)
        }
    }

    fn broadcast_packet<P: Packet>(
        &mut self,
        packet: &P,
        except: &[ConnectionId],
    ) -> Result<usize, NetError> {
        if self.role.is_server() {
            self.broadcast(packet, except)
        } else if except.contains(&ConnectionId::SERVER) {
            Ok(0)
        } else {
            // A client's only peer is the server.
            self.send_to_server(packet).map(|()| 1)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{PacketReader, PacketWriter, WireFormat};
    use crate::transport::MemoryHub;
    use crate::ProtocolError;

    #[derive(Debug, PartialEq)]
    struct Note(u32);

    impl Packet for Note {
        const NAME: &'static str = "Note";
        fn write(&self, writer: &mut dyn PacketWriter) {
            writer.write_u32("value", self.0);
        }
        fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
            Ok(Note(reader.read_u32("value")?))
        }
    }

    fn protocol() -> Protocol {
        Protocol::new(WireFormat::Binary).with::<Note>()
    }

    #[test]
    fn directory_never_reuses_ids() {
        let mut dir = PeerDirectory::new();
        let a = dir.assign(ConnectionId(1));
        assert_eq!(dir.assign(ConnectionId(1)), a);
        assert_eq!(dir.release(ConnectionId(1)), Some(a));
        let b = dir.assign(ConnectionId(1));
        assert_ne!(a, b);
        assert_eq!(dir.connection_for(b), Some(ConnectionId(1)));
        assert_eq!(dir.connection_for(a), None);
    }

    #[test]
    fn client_cannot_broadcast_and_server_cannot_send_to_server() {
        let (hub, server) = MemoryHub::new();
        let mut client =
            NetworkInterface::new(NetRole::Client, Box::new(hub.connect()), protocol());
        assert!(matches!(
            client.broadcast(&Note(1), &[]),
            Err(NetError::WrongRole { operation: "broadcast", .. })
        ));
        let mut server = NetworkInterface::new(NetRole::Server, Box::new(server), protocol());
        assert!(matches!(
            server.send_to_server(&Note(1)),
            Err(NetError::WrongRole { .. })
        ));
    }

    #[test]
    fn integrated_loopback_round_trip() {
        let (_hub, server) = MemoryHub::new();
        let mut net = NetworkInterface::new(NetRole::Integrated, Box::new(server), protocol());

        let events = net.poll();
        let local_id = match &events[..] {
            [NetEvent::PeerConnected {
                connection,
                network_id: Some(id),
            }] if connection.is_local() => *id,
            other => panic!("unexpected events {other:?}"),
        };
        assert_eq!(net.connection_for(local_id), Some(ConnectionId::LOCAL));

        net.send_to_server(&Note(7)).unwrap();
        let events = net.poll();
        let [NetEvent::Frame(frame)] = &events[..] else {
            panic!("expected one frame, got {events:?}");
        };
        assert_eq!(frame.source, ConnectionId::LOCAL);
        assert_eq!(net.protocol().decode::<Note>(&frame.bytes).unwrap(), Note(7));

        assert!(net.send_to(local_id, &Note(8)).unwrap());
        let frames = net.take_local_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(net.protocol().decode::<Note>(&frames[0].bytes).unwrap(), Note(8));

        // The local player is never a broadcast target.
        assert_eq!(net.broadcast(&Note(9), &[]).unwrap(), 0);
        assert!(net.take_local_frames().is_empty());
    }
}
