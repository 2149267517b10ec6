//! Packet types, the per-process packet registry and typed dispatch.
//!
//! Every frame on the wire starts with the sender's [`PacketTypeId`] and the
//! packet's [`PacketFlags`], followed by the packet's own fields in write
//! order. Type ids are handed out by [`Protocol::register`] in registration
//! order; both peers must register the same packets in the same order.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::flags::PacketFlags;
use crate::ids::ConnectionId;
use crate::stream::{FrameReader, PacketReader, PacketWriter, WireFormat};
use crate::ProtocolError;

// ---------------------------------------------------------------------------
// PacketTypeId
// ---------------------------------------------------------------------------

/// Per-process packet type identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketTypeId(pub u16);

impl fmt::Debug for PacketTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketTypeId({})", self.0)
    }
}

impl fmt::Display for PacketTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// A self-describing message.
///
/// `write` and `read` must touch the same fields in the same order.
pub trait Packet: Sized + 'static {
    /// Display name used in logs.
    const NAME: &'static str;

    /// Delivery flags for this instance. Reliable by default.
    fn flags(&self) -> PacketFlags {
        PacketFlags::RELIABLE
    }

    /// Serialize the packet's own fields.
    fn write(&self, writer: &mut dyn PacketWriter);

    /// Deserialize the packet's own fields.
    fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError>;
}

// ---------------------------------------------------------------------------
// FrameHeader / IncomingFrame
// ---------------------------------------------------------------------------

/// Decoded prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub type_id: PacketTypeId,
    pub flags: PacketFlags,
}

/// A raw frame together with the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFrame {
    pub source: ConnectionId,
    pub bytes: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PacketInfo {
    name: &'static str,
    rust_name: &'static str,
}

/// Registry of packet types plus the wire format used to frame them.
#[derive(Debug, Clone)]
pub struct Protocol {
    format: WireFormat,
    by_type: HashMap<TypeId, PacketTypeId>,
    infos: Vec<PacketInfo>,
}

impl Protocol {
    /// Create an empty registry for the given wire format.
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            by_type: HashMap::new(),
            infos: Vec::new(),
        }
    }

    /// Register `P` and return its id.
    ///
    /// # Panics
    ///
    /// Panics if `P` is already registered or the id space is exhausted.
    pub fn register<P: Packet>(&mut self) -> PacketTypeId {
        let rust_type = TypeId::of::<P>();
        assert!(
            !self.by_type.contains_key(&rust_type),
            "packet type '{}' registered twice",
            P::NAME
        );
        let raw = u16::try_from(self.infos.len()).expect("packet type id space exhausted");
        let id = PacketTypeId(raw);
        self.by_type.insert(rust_type, id);
        self.infos.push(PacketInfo {
            name: P::NAME,
            rust_name: std::any::type_name::<P>(),
        });
        id
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<P: Packet>(mut self) -> Self {
        self.register::<P>();
        self
    }

    /// The wire format frames are encoded with.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Id of `P`, if registered.
    pub fn try_type_id<P: Packet>(&self) -> Option<PacketTypeId> {
        self.by_type.get(&TypeId::of::<P>()).copied()
    }

    /// Id of `P`.
    ///
    /// # Panics
    ///
    /// Panics if `P` was never registered.
    pub fn type_id<P: Packet>(&self) -> PacketTypeId {
        self.try_type_id::<P>()
            .unwrap_or_else(|| panic!("packet type '{}' is not registered", P::NAME))
    }

    /// Display name of a registered id.
    pub fn display_name(&self, id: PacketTypeId) -> Option<&'static str> {
        self.infos.get(id.0 as usize).map(|i| i.name)
    }

    /// Full Rust type path of a registered id.
    pub fn rust_name(&self, id: PacketTypeId) -> Option<&'static str> {
        self.infos.get(id.0 as usize).map(|i| i.rust_name)
    }

    /// Number of registered packet types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Encode `packet` into a frame.
    pub fn encode<P: Packet>(&self, packet: &P) -> Result<Vec<u8>, ProtocolError> {
        let flags = packet.flags();
        flags.validate()?;
        let id = self.type_id::<P>();
        let mut writer = self.format.writer();
        {
            let w = writer.as_dyn();
            w.write_u16("type_id", id.0);
            w.write_u8("flags", flags.bits());
            packet.write(w);
        }
        Ok(writer.into_bytes())
    }

    /// Decode the header and return a reader positioned at the payload.
    pub fn open<'a>(
        &self,
        bytes: &'a [u8],
    ) -> Result<(FrameHeader, FrameReader<'a>), ProtocolError> {
        let mut reader = self.format.reader(bytes)?;
        let header = {
            let r = reader.as_dyn();
            let type_id = PacketTypeId(r.read_u16("type_id")?);
            if type_id.0 as usize >= self.infos.len() {
                return Err(ProtocolError::UnknownPacketType { type_id: type_id.0 });
            }
            let flags = PacketFlags::from_bits(r.read_u8("flags")?)?;
            FrameHeader { type_id, flags }
        };
        Ok((header, reader))
    }

    /// Decode only the header.
    pub fn peek_header(&self, bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
        self.open(bytes).map(|(header, _)| header)
    }

    /// Decode a frame known to carry a `P`.
    ///
    /// # Panics
    ///
    /// Panics if the frame's type id is not `P`'s. Receiving a different
    /// packet than the caller expected means the two ends disagree about the
    /// protocol, which is not something to recover from.
    pub fn decode<P: Packet>(&self, bytes: &[u8]) -> Result<P, ProtocolError> {
        let (header, mut reader) = self.open(bytes)?;
        let expected = self.type_id::<P>();
        assert_eq!(
            header.type_id,
            expected,
            "decoded packet type {} ({:?}) does not match expected '{}'",
            header.type_id,
            self.display_name(header.type_id),
            P::NAME
        );
        P::read(reader.as_dyn())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

type HandlerFn<C> =
    Box<dyn Fn(&mut C, ConnectionId, &mut dyn PacketReader) -> Result<(), ProtocolError>>;

/// Result of [`Dispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran.
    Handled(PacketTypeId),
    /// The type is registered but nothing handles it here.
    Unhandled(PacketTypeId),
}

/// Handler table keyed by packet type id.
///
/// `C` is whatever context the handlers need (typically the application
/// state that owns the core and the network interface).
pub struct Dispatcher<C> {
    protocol: Protocol,
    handlers: HashMap<PacketTypeId, HandlerFn<C>>,
}

impl<C> Dispatcher<C> {
    /// Create a dispatcher over a copy of `protocol`.
    pub fn new(protocol: &Protocol) -> Self {
        Self {
            protocol: protocol.clone(),
            handlers: HashMap::new(),
        }
    }

    /// Route packets of type `P` to `handler`.
    ///
    /// # Panics
    ///
    /// Panics if `P` is not registered or already has a handler.
    pub fn on<P, F>(&mut self, handler: F) -> &mut Self
    where
        P: Packet,
        F: Fn(&mut C, ConnectionId, P) + 'static,
    {
        let id = self.protocol.type_id::<P>();
        let boxed: HandlerFn<C> = Box::new(
            move |ctx: &mut C, source: ConnectionId, reader: &mut dyn PacketReader| {
                let packet = P::read(reader)?;
                handler(ctx, source, packet);
                Ok(())
            },
        );
        let previous = self.handlers.insert(id, boxed);
        assert!(previous.is_none(), "packet '{}' handled twice", P::NAME);
        self
    }

    /// Whether a handler exists for `id`.
    pub fn handles(&self, id: PacketTypeId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Decode `frame` and run its handler.
    pub fn dispatch(
        &self,
        ctx: &mut C,
        frame: &IncomingFrame,
    ) -> Result<DispatchOutcome, ProtocolError> {
        let (header, mut reader) = self.protocol.open(&frame.bytes)?;
        match self.handlers.get(&header.type_id) {
            Some(handler) => {
                handler(ctx, frame.source, reader.as_dyn())?;
                Ok(DispatchOutcome::Handled(header.type_id))
            }
            None => {
                debug!(
                    packet = self.protocol.display_name(header.type_id).unwrap_or("?"),
                    source = %frame.source,
                    "no handler registered, dropping packet"
                );
                Ok(DispatchOutcome::Unhandled(header.type_id))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping {
        sequence: u32,
    }

    impl Packet for Ping {
        const NAME: &'static str = "Ping";

        fn flags(&self) -> PacketFlags {
            PacketFlags::UNRELIABLE | PacketFlags::NO_DELAY
        }

        fn write(&self, writer: &mut dyn PacketWriter) {
            writer.write_u32("sequence", self.sequence);
        }

        fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
            Ok(Self {
                sequence: reader.read_u32("sequence")?,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Chat {
        text: String,
    }

    impl Packet for Chat {
        const NAME: &'static str = "Chat";

        fn write(&self, writer: &mut dyn PacketWriter) {
            writer.write_str("text", &self.text);
        }

        fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
            Ok(Self {
                text: reader.read_str("text")?,
            })
        }
    }

    struct BadFlags;

    impl Packet for BadFlags {
        const NAME: &'static str = "BadFlags";

        fn flags(&self) -> PacketFlags {
            PacketFlags::RELIABLE | PacketFlags::NO_DELAY
        }

        fn write(&self, _writer: &mut dyn PacketWriter) {}

        fn read(_reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
            Ok(BadFlags)
        }
    }

    fn protocol(format: WireFormat) -> Protocol {
        Protocol::new(format).with::<Ping>().with::<Chat>()
    }

    #[test]
    fn ids_follow_registration_order() {
        let p = protocol(WireFormat::Binary);
        assert_eq!(p.type_id::<Ping>(), PacketTypeId(0));
        assert_eq!(p.type_id::<Chat>(), PacketTypeId(1));
        assert_eq!(p.display_name(PacketTypeId(1)), Some("Chat"));
        assert!(p.rust_name(PacketTypeId(0)).unwrap().ends_with("Ping"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_registration_panics() {
        let mut p = protocol(WireFormat::Binary);
        p.register::<Ping>();
    }

    #[test]
    fn frame_header_is_type_then_flags() {
        for format in [WireFormat::Binary, WireFormat::Json] {
            let p = protocol(format);
            let bytes = p.encode(&Ping { sequence: 9 }).unwrap();
            let header = p.peek_header(&bytes).unwrap();
            assert_eq!(header.type_id, PacketTypeId(0));
            assert_eq!(header.flags, PacketFlags::UNRELIABLE | PacketFlags::NO_DELAY);
            assert_eq!(p.decode::<Ping>(&bytes).unwrap(), Ping { sequence: 9 });
        }
    }

    #[test]
    fn binary_frame_layout() {
        let p = protocol(WireFormat::Binary);
        let bytes = p.encode(&Ping { sequence: 1 }).unwrap();
        assert_eq!(bytes, vec![0, 0, 0b100, 1, 0, 0, 0]);
    }

    #[test]
    fn invalid_flags_are_rejected_on_encode() {
        let p = Protocol::new(WireFormat::Binary).with::<BadFlags>();
        assert!(matches!(
            p.encode(&BadFlags),
            Err(ProtocolError::InvalidFlags { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "does not match expected")]
    fn decoding_the_wrong_type_is_fatal() {
        let p = protocol(WireFormat::Binary);
        let bytes = p.encode(&Chat { text: "hi".into() }).unwrap();
        let _ = p.decode::<Ping>(&bytes);
    }

    #[test]
    fn unknown_type_id_is_an_error() {
        let p = protocol(WireFormat::Binary);
        let bytes = vec![42, 0, 1];
        assert!(matches!(
            p.peek_header(&bytes),
            Err(ProtocolError::UnknownPacketType { type_id: 42 })
        ));
    }

    #[test]
    fn dispatcher_routes_by_type() {
        #[derive(Default)]
        struct Log {
            pings: Vec<(ConnectionId, u32)>,
            chats: Vec<String>,
        }

        let p = protocol(WireFormat::Json);
        let mut d: Dispatcher<Log> = Dispatcher::new(&p);
        d.on::<Ping, _>(|log, source, ping| log.pings.push((source, ping.sequence)));

        let mut log = Log::default();
        let frame = IncomingFrame {
            source: ConnectionId(3),
            bytes: p.encode(&Ping { sequence: 5 }).unwrap(),
        };
        assert_eq!(
            d.dispatch(&mut log, &frame).unwrap(),
            DispatchOutcome::Handled(PacketTypeId(0))
        );
        assert_eq!(log.pings, vec![(ConnectionId(3), 5)]);

        let chat = IncomingFrame {
            source: ConnectionId(3),
            bytes: p.encode(&Chat { text: "x".into() }).unwrap(),
        };
        assert_eq!(
            d.dispatch(&mut log, &chat).unwrap(),
            DispatchOutcome::Unhandled(PacketTypeId(1))
        );
        assert!(log.chats.is_empty());
    }
}
