//! Replaying replication packets received from a peer, and producing the
//! catch-up packets a late joiner needs.
//!
//! Applying a packet never records it again: whoever forwards remote changes
//! does so with the original packet.

use ember_net::ids::{ConnectionId, NetworkId};
use serde_json::{json, Value};
use tracing::debug;

use crate::component::ComponentTypeId;
use crate::core::Core;
use crate::entity::EntityId;
use crate::replication::{ObjectKind, ReplicationAction, ReplicationPacket};
use crate::view::ViewTypeId;
use crate::EcsError;

impl Core {
    /// Mirror a change made on another machine.
    ///
    /// Destroys of objects that are already gone are ignored, so a
    /// duplicated destroy is harmless. Creates of objects that already exist
    /// overwrite their state. A create naming a component or view this core
    /// added locally without a network id adopts the local object.
    pub fn apply_replication(&mut self, packet: &ReplicationPacket) -> Result<(), EcsError> {
        let was_replaying = std::mem::replace(&mut self.replaying, true);
        let result = match packet.kind {
            ObjectKind::Entity => self.apply_entity(packet),
            ObjectKind::Component => self.apply_component(packet),
            ObjectKind::View => self.apply_view(packet),
        };
        self.replaying = was_replaying;
        result
    }

    /// The connection owning the entity a packet is about.
    ///
    /// Components and views already known here are traced to their real
    /// entity; the packet's `entity` field is only consulted for objects this
    /// core has not seen.
    pub fn owner_of_packet(&self, packet: &ReplicationPacket) -> Option<ConnectionId> {
        let entity = self.packet_entity(packet)?;
        self.entities.get(entity)?.owner
    }

    fn packet_entity(&self, packet: &ReplicationPacket) -> Option<EntityId> {
        let known = match packet.kind {
            ObjectKind::Entity => return self.entities.by_network_id(packet.network_id),
            ObjectKind::Component => self
                .components
                .get(ComponentTypeId(packet.type_id), packet.network_id)
                .and_then(|c| self.components.owner(c)),
            ObjectKind::View => self
                .views
                .get(ViewTypeId(packet.type_id), packet.network_id)
                .and_then(|v| self.views.entity_of(v)),
        };
        known.or_else(|| self.entities.by_network_id(packet.entity))
    }

    fn require_entity(&self, network_id: NetworkId) -> Result<EntityId, EcsError> {
        self.entities
            .by_network_id(network_id)
            .ok_or(EcsError::UnknownNetworkId {
                kind: ObjectKind::Entity,
                network_id,
            })
    }

    fn apply_entity(&mut self, packet: &ReplicationPacket) -> Result<(), EcsError> {
        let network_id = packet.network_id;
        match packet.action {
            ReplicationAction::Create => {
                let owner_peer = owner_from_payload(packet)?;
                let entity = match self.entities.by_network_id(network_id) {
                    Some(entity) => entity,
                    None => {
                        let entity = self.entities.create()?;
                        self.entities.set_network_id(entity, network_id)?;
                        self.network_ids.observe(network_id);
                        entity
                    }
                };
                self.apply_owner(entity, owner_peer)
            }
            ReplicationAction::Update => {
                let owner_peer = owner_from_payload(packet)?;
                let entity = self.require_entity(network_id)?;
                self.apply_owner(entity, owner_peer)
            }
            ReplicationAction::Destroy => match self.entities.by_network_id(network_id) {
                Some(entity) => self.destroy_entity(entity),
                None => {
                    debug!(network_id = %network_id, "destroy for unknown entity ignored");
                    Ok(())
                }
            },
        }
    }

    fn apply_owner(&mut self, entity: EntityId, owner_peer: Option<NetworkId>) -> Result<(), EcsError> {
        let owner = owner_peer.and_then(|p| self.peer_connection(p));
        let record = self
            .entities
            .get(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        if record.owner == owner && record.owner_peer == owner_peer {
            return Ok(());
        }
        self.assign_owner(entity, owner, owner_peer).map(|_| ())
    }

    fn apply_component(&mut self, packet: &ReplicationPacket) -> Result<(), EcsError> {
        let type_id = ComponentTypeId(packet.type_id);
        if !self.registry().contains(type_id) {
            return Err(EcsError::UnknownComponentType {
                type_id: packet.type_id,
            });
        }
        let network_id = packet.network_id;
        let existing = self.components.get(type_id, network_id);

        match packet.action {
            ReplicationAction::Create => {
                if let Some(component) = existing {
                    return self.components.set_from_json(component, &packet.payload);
                }
                let entity = self.require_entity(packet.entity)?;
                if let Some(local) = self.component_ref(entity, type_id) {
                    if self.components.network_id(local).is_none() {
                        // Added here before the server named it.
                        self.components.set_network_id(local, network_id);
                        self.network_ids.observe(network_id);
                        debug!(entity = %entity, network_id = %network_id, "local component adopted");
                        return self.components.set_from_json(local, &packet.payload);
                    }
                    return Err(EcsError::DuplicateComponent {
                        entity,
                        component: self
                            .type_name(ObjectKind::Component, type_id.0)
                            .unwrap_or("?")
                            .to_owned(),
                    });
                }
                let component = self
                    .components
                    .create_from_json(type_id, entity, &packet.payload)?;
                self.components.set_network_id(component, network_id);
                self.network_ids.observe(network_id);
                self.entities
                    .record_mut(entity)?
                    .components
                    .insert(type_id, component);
                self.refresh_views(entity)
            }
            ReplicationAction::Update => {
                let component = existing.ok_or(EcsError::UnknownNetworkId {
                    kind: ObjectKind::Component,
                    network_id,
                })?;
                self.components.set_from_json(component, &packet.payload)
            }
            ReplicationAction::Destroy => {
                let Some(component) = existing else {
                    debug!(network_id = %network_id, "destroy for unknown component ignored");
                    return Ok(());
                };
                let entity = self.components.owner(component);
                self.components.destroy(component);
                match entity {
                    Some(entity) => {
                        if let Some(record) = self.entities.get_mut(entity) {
                            record.components.remove(&type_id);
                        }
                        self.refresh_views(entity)
                    }
                    None => Ok(()),
                }
            }
        }
    }

    fn apply_view(&mut self, packet: &ReplicationPacket) -> Result<(), EcsError> {
        let view_type = ViewTypeId(packet.type_id);
        if self.views.info(view_type).is_none() {
            return Err(EcsError::UnknownViewType {
                type_id: packet.type_id,
            });
        }
        let network_id = packet.network_id;
        let existing = self.views.get(view_type, network_id);

        match packet.action {
            ReplicationAction::Create => {
                if existing.is_some() {
                    return Ok(());
                }
                let entity = self.require_entity(packet.entity)?;
                let local = self.entities.get(entity).and_then(|record| {
                    record
                        .views
                        .iter()
                        .copied()
                        .find(|v| v.type_id == view_type && self.views.network_id(*v).is_none())
                });
                if let Some(view) = local {
                    self.views.set_network_id(view, network_id)?;
                    self.network_ids.observe(network_id);
                    debug!(entity = %entity, network_id = %network_id, "local view adopted");
                    return Ok(());
                }
                let view = self.views.create(view_type)?;
                self.views.attach(view, entity)?;
                self.views.set_network_id(view, network_id)?;
                self.network_ids.observe(network_id);
                self.entities.record_mut(entity)?.views.push(view);
                self.refresh_views(entity)
            }
            ReplicationAction::Update => {
                debug!(network_id = %network_id, "view update carries no state, ignored");
                Ok(())
            }
            ReplicationAction::Destroy => match existing {
                Some(view) => self.remove_view(view),
                None => {
                    debug!(network_id = %network_id, "destroy for unknown view ignored");
                    Ok(())
                }
            },
        }
    }

    /// Create packets describing every networked object, entities first,
    /// each followed by its components and views, in network id order.
    pub fn snapshot_packets(&self) -> Result<Vec<ReplicationPacket>, EcsError> {
        let mut records: Vec<_> = self
            .entities
            .iter()
            .filter_map(|r| r.network_id.map(|n| (n, r)))
            .collect();
        records.sort_by_key(|(network_id, _)| *network_id);

        let mut packets = Vec::new();
        for (entity_network_id, record) in records {
            let mut packet =
                ReplicationPacket::new(ObjectKind::Entity, 0, entity_network_id, ReplicationAction::Create);
            packet.payload = json!({ "owner": record.owner_peer.map(|p| p.0) });
            packets.push(packet);

            for (type_id, component) in &record.components {
                let Some(network_id) = self.components.network_id(*component) else {
                    continue;
                };
                let mut packet = ReplicationPacket::new(
                    ObjectKind::Component,
                    type_id.0,
                    network_id,
                    ReplicationAction::Create,
                );
                packet.entity = entity_network_id;
                packet.payload = self.components.serialize(*component)?;
                packets.push(packet);
            }
            for view in &record.views {
                let Some(network_id) = self.views.network_id(*view) else {
                    continue;
                };
                let mut packet = ReplicationPacket::new(
                    ObjectKind::View,
                    view.type_id.0,
                    network_id,
                    ReplicationAction::Create,
                );
                packet.entity = entity_network_id;
                packets.push(packet);
            }
        }
        Ok(packets)
    }
}

fn owner_from_payload(packet: &ReplicationPacket) -> Result<Option<NetworkId>, EcsError> {
    match packet.payload.get("owner") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|raw| u32::try_from(raw).ok())
            .map(|raw| Some(NetworkId(raw)))
            .ok_or_else(|| EcsError::InvalidPayload {
                kind: packet.kind,
                network_id: packet.network_id,
                details: format!("owner must be a peer id or null, got {value}"),
            }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
