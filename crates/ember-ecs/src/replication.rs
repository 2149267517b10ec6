//! Replication packets, the per-session recorder and its scope guard.
//!
//! While a session is open, every lifecycle or ownership change to a
//! networked object is mirrored into a [`ReplicationPacket`]. Updates to the
//! same object coalesce into one packet, so a session produces at most one
//! packet per object touched. Closing the session broadcasts the queue in
//! order and empties it.
//!
//! # Wire layout
//!
//! After the frame header: `kind: u8`, `type_id: u16`, `network_id: u32`,
//! `action: u8`, then `entity: u32` for components and views, then the
//! payload as a JSON string.

use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use ember_net::flags::PacketFlags;
use ember_net::ids::{ConnectionId, NetworkId};
use ember_net::interface::PacketSink;
use ember_net::protocol::Packet;
use ember_net::stream::{PacketReader, PacketWriter};
use ember_net::{NetError, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::Core;

// ---------------------------------------------------------------------------
// Kinds and actions
// ---------------------------------------------------------------------------

/// What a replication packet describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    Entity = 0,
    Component = 1,
    View = 2,
}

impl ObjectKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Entity),
            1 => Some(Self::Component),
            2 => Some(Self::View),
            _ => None,
        }
    }
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReplicationAction {
    Create = 0,
    Update = 1,
    Destroy = 2,
}

impl ReplicationAction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Create),
            1 => Some(Self::Update),
            2 => Some(Self::Destroy),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ReplicationPacket
// ---------------------------------------------------------------------------

/// One mirrored change to a networked object.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationPacket {
    pub kind: ObjectKind,
    /// Component or view type id; `0` for entities.
    pub type_id: u16,
    pub network_id: NetworkId,
    pub action: ReplicationAction,
    /// Network id of the owning entity. [`NetworkId::NONE`] for entities.
    pub entity: NetworkId,
    /// Entities: `{"owner": peer-id-or-null}`. Components: the component's
    /// JSON form. Views and destroys: `null`.
    pub payload: Value,
}

impl ReplicationPacket {
    pub fn new(
        kind: ObjectKind,
        type_id: u16,
        network_id: NetworkId,
        action: ReplicationAction,
    ) -> Self {
        Self {
            kind,
            type_id,
            network_id,
            action,
            entity: NetworkId::NONE,
            payload: Value::Null,
        }
    }

    /// Coalescing key.
    pub fn key(&self) -> (ObjectKind, u16, NetworkId) {
        (self.kind, self.type_id, self.network_id)
    }

    fn matches(&self, kind: ObjectKind, type_id: u16, network_id: NetworkId) -> bool {
        self.key() == (kind, type_id, network_id)
    }
}

impl Packet for ReplicationPacket {
    const NAME: &'static str = "Replication";

    fn flags(&self) -> PacketFlags {
        PacketFlags::RELIABLE
    }

    fn write(&self, writer: &mut dyn PacketWriter) {
        writer.write_u8("kind", self.kind as u8);
        writer.write_u16("type_id", self.type_id);
        writer.write_u32("network_id", self.network_id.0);
        writer.write_u8("action", self.action as u8);
        if self.kind != ObjectKind::Entity {
            writer.write_u32("entity", self.entity.0);
        }
        writer.write_str("payload", &self.payload.to_string());
    }

    fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
        let raw_kind = reader.read_u8("kind")?;
        let kind = ObjectKind::from_u8(raw_kind).ok_or_else(|| ProtocolError::InvalidValue {
            name: "kind".into(),
            details: format!("unknown object kind {raw_kind}"),
        })?;
        let type_id = reader.read_u16("type_id")?;
        let network_id = NetworkId(reader.read_u32("network_id")?);
        let raw_action = reader.read_u8("action")?;
        let action =
            ReplicationAction::from_u8(raw_action).ok_or_else(|| ProtocolError::InvalidValue {
                name: "action".into(),
                details: format!("unknown action {raw_action}"),
            })?;
        let entity = if kind == ObjectKind::Entity {
            NetworkId::NONE
        } else {
            NetworkId(reader.read_u32("entity")?)
        };
        let text = reader.read_str("payload")?;
        let payload = serde_json::from_str(&text).map_err(|e| ProtocolError::InvalidValue {
            name: "payload".into(),
            details: e.to_string(),
        })?;
        Ok(Self {
            kind,
            type_id,
            network_id,
            action,
            entity,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// ThreadOwner
// ---------------------------------------------------------------------------

/// Remembers the thread that created it and asserts later calls come from
/// the same thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadOwner {
    thread: ThreadId,
}

impl ThreadOwner {
    pub fn current() -> Self {
        Self {
            thread: thread::current().id(),
        }
    }

    /// # Panics
    ///
    /// Panics when called from any thread but the owner.
    #[track_caller]
    pub fn assert_owner(&self, operation: &str) {
        let here = thread::current().id();
        assert_eq!(
            here, self.thread,
            "{operation} called from {here:?}, but the replication recorder belongs to {:?}",
            self.thread
        );
    }
}

impl Default for ThreadOwner {
    fn default() -> Self {
        Self::current()
    }
}

// ---------------------------------------------------------------------------
// ReplicationRecorder
// ---------------------------------------------------------------------------

/// Session-scoped packet queue with coalescing.
///
/// Not synchronized: every entry point asserts it runs on the thread that
/// created the recorder.
#[derive(Debug, Default)]
pub struct ReplicationRecorder {
    owner: ThreadOwner,
    open: bool,
    queue: Vec<ReplicationPacket>,
}

impl ReplicationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session.
    ///
    /// # Panics
    ///
    /// Panics if a session is already open.
    pub fn begin(&mut self) {
        self.owner.assert_owner("begin_replication");
        assert!(!self.open, "begin_replication called while a session is open");
        self.open = true;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Queued packets, in broadcast order.
    pub fn packets(&self) -> &[ReplicationPacket] {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append a new packet.
    ///
    /// # Panics
    ///
    /// Panics if no session is open.
    pub fn replicate(
        &mut self,
        kind: ObjectKind,
        type_id: u16,
        network_id: NetworkId,
        action: ReplicationAction,
    ) -> &mut ReplicationPacket {
        self.owner.assert_owner("replicate");
        assert!(self.open, "replicate called with no open session");
        self.queue
            .push(ReplicationPacket::new(kind, type_id, network_id, action));
        let last = self.queue.len() - 1;
        &mut self.queue[last]
    }

    pub fn replicate_create(
        &mut self,
        kind: ObjectKind,
        type_id: u16,
        network_id: NetworkId,
    ) -> &mut ReplicationPacket {
        self.replicate(kind, type_id, network_id, ReplicationAction::Create)
    }

    /// Record that an object went away.
    ///
    /// A destroy supersedes anything queued for the object: a pending update
    /// is replaced, and a pending create cancels out together with the
    /// destroy, in which case `None` is returned. Destroying an entity also
    /// drops queued packets for its components and views, since the remote
    /// side cascades. Destroying twice keeps one destroy.
    pub fn replicate_destroy(
        &mut self,
        kind: ObjectKind,
        type_id: u16,
        network_id: NetworkId,
    ) -> Option<&mut ReplicationPacket> {
        self.owner.assert_owner("replicate_destroy");
        assert!(self.open, "replicate_destroy called with no open session");

        if let Some(pos) = self
            .queue
            .iter()
            .position(|p| p.matches(kind, type_id, network_id) && p.action == ReplicationAction::Destroy)
        {
            return Some(&mut self.queue[pos]);
        }

        let created_here = self
            .queue
            .iter()
            .any(|p| p.matches(kind, type_id, network_id) && p.action == ReplicationAction::Create);
        self.queue.retain(|p| !p.matches(kind, type_id, network_id));
        if kind == ObjectKind::Entity {
            self.queue
                .retain(|p| p.kind == ObjectKind::Entity || p.entity != network_id);
        }
        if created_here {
            debug!(?kind, type_id, network_id = %network_id, "create and destroy cancelled out");
            return None;
        }
        Some(self.replicate(kind, type_id, network_id, ReplicationAction::Destroy))
    }

    /// Record a change, coalescing with a pending create or update.
    ///
    /// A pending update moves to the end of the queue; a pending create keeps
    /// its place so objects created after it in the same session still
    /// arrive after it. Returns `None` when the object was already destroyed
    /// in this session.
    pub fn replicate_update(
        &mut self,
        kind: ObjectKind,
        type_id: u16,
        network_id: NetworkId,
    ) -> Option<&mut ReplicationPacket> {
        self.owner.assert_owner("replicate_update");
        assert!(self.open, "replicate_update called with no open session");

        let pos = self
            .queue
            .iter()
            .position(|p| p.matches(kind, type_id, network_id));
        match pos {
            Some(pos) => match self.queue[pos].action {
                ReplicationAction::Destroy => {
                    debug!(?kind, type_id, network_id = %network_id, "update after destroy dropped");
                    None
                }
                ReplicationAction::Create => Some(&mut self.queue[pos]),
                ReplicationAction::Update => {
                    let packet = self.queue.remove(pos);
                    self.queue.push(packet);
                    let last = self.queue.len() - 1;
                    Some(&mut self.queue[last])
                }
            },
            None => Some(self.replicate(kind, type_id, network_id, ReplicationAction::Update)),
        }
    }

    /// Close the session and broadcast the queue to every peer not in
    /// `except`. A no-op when no session is open.
    ///
    /// The session is closed and the queue emptied even if a send fails.
    pub fn end<S: PacketSink + ?Sized>(
        &mut self,
        sink: &mut S,
        except: &[ConnectionId],
    ) -> Result<usize, NetError> {
        self.owner.assert_owner("end_replication");
        if !self.open {
            return Ok(0);
        }
        self.open = false;
        let queue = std::mem::take(&mut self.queue);
        let count = queue.len();
        for packet in &queue {
            sink.broadcast_packet(packet, except)?;
        }
        if count > 0 {
            debug!(packets = count, "replication session flushed");
        }
        Ok(count)
    }

    /// Close the session without sending anything.
    pub fn discard(&mut self) -> Vec<ReplicationPacket> {
        self.owner.assert_owner("discard_replication");
        self.open = false;
        std::mem::take(&mut self.queue)
    }
}

// ---------------------------------------------------------------------------
// ReplicationScope
// ---------------------------------------------------------------------------

/// An open replication session on a [`Core`].
///
/// Dereferences to the core. The session ends when [`finish`](Self::finish)
/// is called or the scope is dropped, whichever comes first.
pub struct ReplicationScope<'a, S: PacketSink> {
    core: &'a mut Core,
    sink: &'a mut S,
    except: Vec<ConnectionId>,
    finished: bool,
}

impl<'a, S: PacketSink> ReplicationScope<'a, S> {
    pub(crate) fn new(core: &'a mut Core, sink: &'a mut S, except: &[ConnectionId]) -> Self {
        core.begin_replication();
        Self {
            core,
            sink,
            except: except.to_vec(),
            finished: false,
        }
    }

    /// End the session now and report how many packets were broadcast.
    pub fn finish(mut self) -> Result<usize, NetError> {
        self.finished = true;
        self.core.end_replication(&mut *self.sink, &self.except)
    }
}

impl<S: PacketSink> Deref for ReplicationScope<'_, S> {
    type Target = Core;

    fn deref(&self) -> &Core {
        &*self.core
    }
}

impl<S: PacketSink> DerefMut for ReplicationScope<'_, S> {
    fn deref_mut(&mut self) -> &mut Core {
        &mut *self.core
    }
}

impl<S: PacketSink> Drop for ReplicationScope<'_, S> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.core.end_replication(&mut *self.sink, &self.except) {
            warn!(error = %e, "replication session ended with a send failure");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ember_net::protocol::Protocol;
    use ember_net::stream::WireFormat;

    /// Collects broadcast packets.
    #[derive(Default)]
    pub(crate) struct Collect {
        pub sent: Vec<(ReplicationPacket, Vec<ConnectionId>)>,
    }

    impl PacketSink for Collect {
        fn send_packet<P: Packet>(&mut self, _to: ConnectionId, _packet: &P) -> Result<(), NetError> {
            Ok(())
        }

        fn broadcast_packet<P: Packet>(
            &mut self,
            packet: &P,
            except: &[ConnectionId],
        ) -> Result<usize, NetError> {
            let protocol = Protocol::new(WireFormat::Binary).with::<ReplicationPacket>();
            let bytes = protocol.encode(packet)?;
            let packet: ReplicationPacket = protocol.decode(&bytes)?;
            self.sent.push((packet, except.to_vec()));
            Ok(1)
        }
    }

    const C: ObjectKind = ObjectKind::Component;

    #[test]
    #[should_panic(expected = "while a session is open")]
    fn double_begin_panics() {
        let mut rec = ReplicationRecorder::new();
        rec.begin();
        rec.begin();
    }

    #[test]
    fn end_while_closed_is_a_no_op() {
        let mut rec = ReplicationRecorder::new();
        let mut sink = Collect::default();
        assert_eq!(rec.end(&mut sink, &[]).unwrap(), 0);
        assert!(sink.sent.is_empty());
    }

    #[test]
    #[should_panic(expected = "no open session")]
    fn replicate_requires_an_open_session() {
        let mut rec = ReplicationRecorder::new();
        rec.replicate_create(C, 0, NetworkId(1));
    }

    #[test]
    fn updates_coalesce_and_move_to_the_end() {
        let mut rec = ReplicationRecorder::new();
        rec.begin();
        rec.replicate_update(C, 0, NetworkId(1)).unwrap().payload = 1.into();
        rec.replicate_update(C, 0, NetworkId(2)).unwrap();
        rec.replicate_update(C, 0, NetworkId(1)).unwrap().payload = 2.into();
        let ids: Vec<u32> = rec.packets().iter().map(|p| p.network_id.0).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(rec.packets()[1].payload, Value::from(2));
    }

    #[test]
    fn update_folds_into_pending_create_in_place() {
        let mut rec = ReplicationRecorder::new();
        rec.begin();
        rec.replicate_create(ObjectKind::Entity, 0, NetworkId(1));
        rec.replicate_create(C, 0, NetworkId(2)).entity = NetworkId(1);
        rec.replicate_update(ObjectKind::Entity, 0, NetworkId(1))
            .unwrap()
            .payload = serde_json::json!({"owner": 7});
        assert_eq!(rec.len(), 2);
        assert_eq!(rec.packets()[0].action, ReplicationAction::Create);
        assert_eq!(rec.packets()[0].payload["owner"], 7);
    }

    #[test]
    fn destroy_supersedes_update_and_blocks_later_updates() {
        let mut rec = ReplicationRecorder::new();
        rec.begin();
        rec.replicate_update(C, 0, NetworkId(1));
        rec.replicate_destroy(C, 0, NetworkId(1)).unwrap();
        assert!(rec.replicate_update(C, 0, NetworkId(1)).is_none());
        rec.replicate_destroy(C, 0, NetworkId(1)).unwrap();
        assert_eq!(rec.len(), 1);
        assert_eq!(rec.packets()[0].action, ReplicationAction::Destroy);
    }

    #[test]
    fn create_then_destroy_cancels() {
        let mut rec = ReplicationRecorder::new();
        rec.begin();
        rec.replicate_create(ObjectKind::Entity, 0, NetworkId(1));
        rec.replicate_create(C, 3, NetworkId(2)).entity = NetworkId(1);
        rec.replicate_update(C, 4, NetworkId(9)).unwrap().entity = NetworkId(8);
        assert!(rec
            .replicate_destroy(ObjectKind::Entity, 0, NetworkId(1))
            .is_none());
        assert_eq!(rec.len(), 1);
        assert_eq!(rec.packets()[0].network_id, NetworkId(9));
    }

    #[test]
    fn entity_destroy_drops_its_component_traffic() {
        let mut rec = ReplicationRecorder::new();
        rec.begin();
        rec.replicate_update(C, 0, NetworkId(2)).unwrap().entity = NetworkId(1);
        rec.replicate_destroy(ObjectKind::Entity, 0, NetworkId(1))
            .unwrap();
        assert_eq!(rec.len(), 1);
        assert_eq!(rec.packets()[0].kind, ObjectKind::Entity);
    }

    #[test]
    fn end_broadcasts_in_order_with_except() {
        let mut rec = ReplicationRecorder::new();
        let mut sink = Collect::default();
        rec.begin();
        rec.replicate_create(ObjectKind::Entity, 0, NetworkId(1)).payload =
            serde_json::json!({"owner": null});
        rec.replicate_update(C, 2, NetworkId(3)).unwrap().entity = NetworkId(1);
        let sent = rec.end(&mut sink, &[ConnectionId(4)]).unwrap();
        assert_eq!(sent, 2);
        assert!(!rec.is_open());
        assert!(rec.is_empty());
        assert_eq!(sink.sent[0].0.kind, ObjectKind::Entity);
        assert_eq!(sink.sent[1].0.entity, NetworkId(1));
        assert_eq!(sink.sent[1].1, vec![ConnectionId(4)]);
    }

    #[test]
    fn foreign_thread_is_rejected() {
        let mut rec = ReplicationRecorder::new();
        let result = std::thread::spawn(move || {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| rec.begin())).is_err()
        })
        .join()
        .unwrap();
        assert!(result);
    }

    #[test]
    fn malformed_kind_is_a_protocol_error() {
        let protocol = Protocol::new(WireFormat::Json).with::<ReplicationPacket>();
        let mut packet = ReplicationPacket::new(C, 1, NetworkId(2), ReplicationAction::Update);
        packet.entity = NetworkId(1);
        let bytes = protocol.encode(&packet).unwrap();
        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value["kind"] = Value::from(9);
        let tampered = serde_json::to_vec(&value).unwrap();
        assert!(protocol.decode::<ReplicationPacket>(&tampered).is_err());
    }
}
