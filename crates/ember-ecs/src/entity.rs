//! Entity identifiers, allocation and records.
//!
//! An [`EntityId`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. The generation is bumped
//! every time an index is recycled, so a handle to a destroyed entity never
//! resolves to whatever reuses its slot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use ember_net::ids::{ConnectionId, NetworkId};
use serde::{Deserialize, Serialize};

use crate::component::ComponentTypeId;
use crate::storage::ComponentRef;
use crate::view::ViewRef;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Allocates and recycles [`EntityId`]s with generational tracking.
///
/// Free indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free_indices: VecDeque<u32>,
    alive_count: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh [`EntityId`], reusing a recycled index when one is
    /// available.
    pub fn allocate(&mut self) -> EntityId {
        self.alive_count += 1;
        if let Some(index) = self.free_indices.pop_front() {
            // Generation was already bumped on deallocate.
            self.alive[index as usize] = true;
            EntityId::new(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.alive.push(true);
            EntityId::new(index, 0)
        }
    }

    /// Deallocate an entity and bump the generation of its index.
    ///
    /// Returns `false` if the entity was already dead or the handle is stale.
    pub fn deallocate(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let idx = id.index() as usize;
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_indices.push_back(id.index());
        self.alive_count -= 1;
        true
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        let idx = id.index() as usize;
        idx < self.generations.len() && self.alive[idx] && self.generations[idx] == id.generation()
    }

    pub fn alive_count(&self) -> usize {
        self.alive_count
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// Everything the registry knows about one live entity.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: EntityId,
    /// Assigned once by the authority; `None` for local-only entities.
    pub network_id: Option<NetworkId>,
    /// The connection that controls this entity, if any.
    pub owner: Option<ConnectionId>,
    /// The owner as every machine knows it: its peer network id. Connection
    /// ids are local, so this is what replication carries.
    pub owner_peer: Option<NetworkId>,
    /// At most one component per type.
    pub components: BTreeMap<ComponentTypeId, ComponentRef>,
    /// Attached view instances, in attach order.
    pub views: Vec<ViewRef>,
}

impl EntityRecord {
    fn new(id: EntityId) -> Self {
        Self {
            id,
            network_id: None,
            owner: None,
            owner_peer: None,
            components: BTreeMap::new(),
            views: Vec::new(),
        }
    }

    pub fn component(&self, type_id: ComponentTypeId) -> Option<ComponentRef> {
        self.components.get(&type_id).copied()
    }

    pub fn is_networked(&self) -> bool {
        self.network_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

/// Owns entity records. Cascading destruction of components and views is
/// done by [`Core`](crate::core::Core), which owns all three registries.
#[derive(Debug)]
pub struct EntityRegistry {
    allocator: EntityAllocator,
    records: Vec<Option<EntityRecord>>,
    by_network: HashMap<NetworkId, EntityId>,
    max_entities: usize,
}

impl EntityRegistry {
    pub fn new(max_entities: usize) -> Self {
        Self {
            allocator: EntityAllocator::new(),
            records: Vec::new(),
            by_network: HashMap::new(),
            max_entities,
        }
    }

    /// Allocate a new, empty, local-only entity.
    pub fn create(&mut self) -> Result<EntityId, EcsError> {
        if self.allocator.alive_count() >= self.max_entities {
            return Err(EcsError::EntityLimitReached {
                limit: self.max_entities,
            });
        }
        let id = self.allocator.allocate();
        let idx = id.index() as usize;
        if idx >= self.records.len() {
            self.records.resize_with(idx + 1, || None);
        }
        self.records[idx] = Some(EntityRecord::new(id));
        Ok(id)
    }

    /// Remove `id` and return its record. Components and views listed in the
    /// record are the caller's to clean up.
    pub fn remove(&mut self, id: EntityId) -> Option<EntityRecord> {
        if !self.allocator.deallocate(id) {
            return None;
        }
        let record = self.records[id.index() as usize].take()?;
        if let Some(network_id) = record.network_id {
            self.by_network.remove(&network_id);
        }
        Some(record)
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        self.allocator.is_alive(id)
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        if !self.allocator.is_alive(id) {
            return None;
        }
        self.records.get(id.index() as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        if !self.allocator.is_alive(id) {
            return None;
        }
        self.records.get_mut(id.index() as usize)?.as_mut()
    }

    /// Like [`get_mut`](Self::get_mut) but reports stale handles.
    pub fn record_mut(&mut self, id: EntityId) -> Result<&mut EntityRecord, EcsError> {
        self.get_mut(id).ok_or(EcsError::StaleEntity { entity: id })
    }

    /// Give `id` its network id.
    ///
    /// # Panics
    ///
    /// Panics if the entity already has a network id or another live entity
    /// uses `network_id`.
    pub fn set_network_id(&mut self, id: EntityId, network_id: NetworkId) -> Result<(), EcsError> {
        if let Some(other) = self.by_network.get(&network_id) {
            panic!("network id {network_id} already belongs to entity {other}");
        }
        let record = self.record_mut(id)?;
        assert!(
            record.network_id.is_none(),
            "entity {id} already has network id {:?}",
            record.network_id
        );
        record.network_id = Some(network_id);
        self.by_network.insert(network_id, id);
        Ok(())
    }

    pub fn by_network_id(&self, network_id: NetworkId) -> Option<EntityId> {
        self.by_network.get(&network_id).copied()
    }

    /// Set the owner and return the previous one.
    pub fn set_owner(
        &mut self,
        id: EntityId,
        owner: Option<ConnectionId>,
    ) -> Result<Option<ConnectionId>, EcsError> {
        let record = self.record_mut(id)?;
        Ok(std::mem::replace(&mut record.owner, owner))
    }

    /// Live entities owned by `connection`, in index order.
    pub fn owned_by(&self, connection: ConnectionId) -> Vec<EntityId> {
        self.iter()
            .filter(|r| r.owner == Some(connection))
            .map(|r| r.id)
            .collect()
    }

    /// Live records in index order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.iter().filter_map(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.allocator.alive_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entities(&self) -> usize {
        self.max_entities
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_increments_on_recycle() {
        let mut alloc = EntityAllocator::new();
        let e0 = alloc.allocate();
        assert_eq!(e0.generation(), 0);
        assert!(alloc.deallocate(e0));
        let e1 = alloc.allocate();
        assert_eq!(e1.index(), e0.index());
        assert_eq!(e1.generation(), 1);
        assert!(!alloc.is_alive(e0), "stale ID should not be alive");
        assert!(!alloc.deallocate(e0));
        assert_eq!(alloc.alive_count(), 1);
    }

    #[test]
    fn registry_respects_entity_limit() {
        let mut reg = EntityRegistry::new(2);
        let a = reg.create().unwrap();
        reg.create().unwrap();
        assert!(matches!(
            reg.create(),
            Err(EcsError::EntityLimitReached { limit: 2 })
        ));
        reg.remove(a).unwrap();
        assert!(reg.create().is_ok());
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut reg = EntityRegistry::new(8);
        let a = reg.create().unwrap();
        reg.remove(a).unwrap();
        let b = reg.create().unwrap();
        assert_eq!(a.index(), b.index());
        assert!(reg.get(a).is_none());
        assert!(reg.get(b).is_some());
        assert!(matches!(
            reg.set_owner(a, None),
            Err(EcsError::StaleEntity { .. })
        ));
    }

    #[test]
    fn network_ids_index_records() {
        let mut reg = EntityRegistry::new(8);
        let a = reg.create().unwrap();
        reg.set_network_id(a, NetworkId(7)).unwrap();
        assert_eq!(reg.by_network_id(NetworkId(7)), Some(a));
        assert!(reg.get(a).unwrap().is_networked());
        reg.remove(a);
        assert_eq!(reg.by_network_id(NetworkId(7)), None);
    }

    #[test]
    fn ownership_queries() {
        let mut reg = EntityRegistry::new(8);
        let a = reg.create().unwrap();
        let b = reg.create().unwrap();
        assert_eq!(reg.set_owner(a, Some(ConnectionId(3))).unwrap(), None);
        assert_eq!(
            reg.set_owner(a, Some(ConnectionId(3))).unwrap(),
            Some(ConnectionId(3))
        );
        reg.set_owner(b, Some(ConnectionId(4))).unwrap();
        assert_eq!(reg.owned_by(ConnectionId(3)), vec![a]);
    }
}
