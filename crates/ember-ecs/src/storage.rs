//! Fixed-capacity component pools.
//!
//! Each registered component type gets one [`ComponentPool`] whose slots are
//! allocated up front. A [`ComponentRef`] names a slot by index and
//! generation; destroying a component bumps the slot's generation so every
//! outstanding reference to it stops resolving, even after the slot is reused.
//!
//! [`ComponentStorage`] holds the pools type-erased, keyed by
//! [`ComponentTypeId`], so the rest of the core can work with components it
//! only knows by id (replication payloads arrive as JSON).

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use ember_net::ids::NetworkId;
use serde_json::Value;
use tracing::error;

use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId};
use crate::entity::EntityId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentRef
// ---------------------------------------------------------------------------

/// Handle to one component slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentRef {
    pub type_id: ComponentTypeId,
    pub index: u32,
    pub generation: u32,
}

impl fmt::Debug for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ComponentRef({}:{}v{})",
            self.type_id.0, self.index, self.generation
        )
    }
}

// ---------------------------------------------------------------------------
// ComponentPool
// ---------------------------------------------------------------------------

/// A live component and its bookkeeping.
#[derive(Debug, Clone)]
pub struct Occupant<T> {
    pub entity: EntityId,
    pub network_id: Option<NetworkId>,
    pub value: T,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    occupant: Option<Occupant<T>>,
}

/// Preallocated, generational storage for one component type.
#[derive(Debug)]
pub struct ComponentPool<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
    live: usize,
}

impl<T> ComponentPool<T> {
    /// Allocate all `capacity` slots now.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                occupant: None,
            })
            .collect();
        Self {
            slots,
            free: (0..capacity as u32).collect(),
            live: 0,
        }
    }

    /// Place a component in a free slot. Returns `(index, generation)`, or
    /// `None` when every slot is taken.
    pub fn insert(&mut self, entity: EntityId, value: T) -> Option<(u32, u32)> {
        let index = self.free.pop_front()?;
        let slot = &mut self.slots[index as usize];
        slot.occupant = Some(Occupant {
            entity,
            network_id: None,
            value,
        });
        self.live += 1;
        Some((index, slot.generation))
    }

    /// Empty a slot and invalidate references to it.
    pub fn remove(&mut self, index: u32, generation: u32) -> Option<Occupant<T>> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let occupant = slot.occupant.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(index);
        self.live -= 1;
        Some(occupant)
    }

    pub fn get(&self, index: u32, generation: u32) -> Option<&Occupant<T>> {
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.occupant.as_ref()
    }

    pub fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut Occupant<T>> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.occupant.as_mut()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// `(index, generation)` of every live slot, in index order.
    pub fn live_slots(&self) -> Vec<(u32, u32)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.occupant.is_some())
            .map(|(i, s)| (i as u32, s.generation))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Type-erased pool
// ---------------------------------------------------------------------------

trait ErasedPool {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn remove(&mut self, index: u32, generation: u32) -> bool;
    fn is_live(&self, index: u32, generation: u32) -> bool;
    fn owner(&self, index: u32, generation: u32) -> Option<EntityId>;
    fn network_id(&self, index: u32, generation: u32) -> Option<NetworkId>;
    fn set_network_id(&mut self, index: u32, generation: u32, id: Option<NetworkId>) -> bool;
    fn to_json(&self, index: u32, generation: u32) -> Option<Result<Value, serde_json::Error>>;
    fn set_json(&mut self, index: u32, generation: u32, value: &Value)
        -> Option<Result<(), serde_json::Error>>;
    fn insert_json(
        &mut self,
        entity: EntityId,
        value: &Value,
    ) -> Result<Option<(u32, u32)>, serde_json::Error>;
    fn live_slots(&self) -> Vec<(u32, u32)>;
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
}

impl<T: Component> ErasedPool for ComponentPool<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn remove(&mut self, index: u32, generation: u32) -> bool {
        ComponentPool::remove(self, index, generation).is_some()
    }

    fn is_live(&self, index: u32, generation: u32) -> bool {
        self.get(index, generation).is_some()
    }

    fn owner(&self, index: u32, generation: u32) -> Option<EntityId> {
        self.get(index, generation).map(|o| o.entity)
    }

    fn network_id(&self, index: u32, generation: u32) -> Option<NetworkId> {
        self.get(index, generation).and_then(|o| o.network_id)
    }

    fn set_network_id(&mut self, index: u32, generation: u32, id: Option<NetworkId>) -> bool {
        match self.get_mut(index, generation) {
            Some(o) => {
                o.network_id = id;
                true
            }
            None => false,
        }
    }

    fn to_json(&self, index: u32, generation: u32) -> Option<Result<Value, serde_json::Error>> {
        self.get(index, generation)
            .map(|o| serde_json::to_value(&o.value))
    }

    fn set_json(
        &mut self,
        index: u32,
        generation: u32,
        value: &Value,
    ) -> Option<Result<(), serde_json::Error>> {
        let occupant = self.get_mut(index, generation)?;
        Some(T::deserialize(value).map(|v| occupant.value = v))
    }

    fn insert_json(
        &mut self,
        entity: EntityId,
        value: &Value,
    ) -> Result<Option<(u32, u32)>, serde_json::Error> {
        let value = T::deserialize(value)?;
        Ok(self.insert(entity, value))
    }

    fn live_slots(&self) -> Vec<(u32, u32)> {
        ComponentPool::live_slots(self)
    }

    fn len(&self) -> usize {
        ComponentPool::len(self)
    }

    fn capacity(&self) -> usize {
        ComponentPool::capacity(self)
    }
}

// ---------------------------------------------------------------------------
// ComponentStorage
// ---------------------------------------------------------------------------

/// All component pools, keyed by [`ComponentTypeId`].
#[derive(Default)]
pub struct ComponentStorage {
    registry: ComponentRegistry,
    pools: Vec<Box<dyn ErasedPool>>,
    by_network: HashMap<(ComponentTypeId, NetworkId), ComponentRef>,
}

impl ComponentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Register `T` with a pool of `capacity` slots.
    pub fn register<T: Component>(&mut self, name: &str, capacity: usize) -> ComponentTypeId {
        let (id, created) = self.registry.register::<T>(name, capacity);
        if created {
            self.pools.push(Box::new(ComponentPool::<T>::new(capacity)));
        }
        id
    }

    fn info(&self, type_id: ComponentTypeId) -> Result<&ComponentInfo, EcsError> {
        self.registry
            .get_info(type_id)
            .ok_or(EcsError::UnknownComponentType { type_id: type_id.0 })
    }

    fn pool(&self, type_id: ComponentTypeId) -> Option<&dyn ErasedPool> {
        self.pools.get(type_id.0 as usize).map(|p| p.as_ref())
    }

    fn pool_mut(&mut self, type_id: ComponentTypeId) -> Option<&mut (dyn ErasedPool + 'static)> {
        self.pools.get_mut(type_id.0 as usize).map(|p| p.as_mut())
    }

    fn typed<T: Component>(&self) -> Option<(ComponentTypeId, &ComponentPool<T>)> {
        let id = self.registry.lookup::<T>()?;
        let pool = self.pool(id)?.as_any().downcast_ref::<ComponentPool<T>>()?;
        Some((id, pool))
    }

    fn typed_mut<T: Component>(&mut self) -> Option<(ComponentTypeId, &mut ComponentPool<T>)> {
        let id = self.registry.lookup::<T>()?;
        let pool = self
            .pool_mut(id)?
            .as_any_mut()
            .downcast_mut::<ComponentPool<T>>()?;
        Some((id, pool))
    }

    fn exhausted(&self, type_id: ComponentTypeId) -> EcsError {
        let (component, capacity) = match self.registry.get_info(type_id) {
            Some(info) => (info.name.clone(), info.capacity),
            None => (format!("#{}", type_id.0), 0),
        };
        error!(component = %component, capacity, "component pool exhausted");
        EcsError::PoolExhausted {
            component,
            capacity,
        }
    }

    /// Allocate a `T` owned by `entity`.
    ///
    /// # Panics
    ///
    /// Panics if `T` was never registered.
    pub fn create<T: Component>(&mut self, entity: EntityId, value: T) -> Result<ComponentRef, EcsError> {
        let (type_id, pool) = self.typed_mut::<T>().unwrap_or_else(|| {
            panic!(
                "component type '{}' is not registered",
                std::any::type_name::<T>()
            )
        });
        match pool.insert(entity, value) {
            Some((index, generation)) => Ok(ComponentRef {
                type_id,
                index,
                generation,
            }),
            None => Err(self.exhausted(type_id)),
        }
    }

    /// Allocate a component of `type_id` from its JSON form.
    pub fn create_from_json(
        &mut self,
        type_id: ComponentTypeId,
        entity: EntityId,
        value: &Value,
    ) -> Result<ComponentRef, EcsError> {
        let name = self.info(type_id)?.name.clone();
        let pool = self
            .pool_mut(type_id)
            .ok_or(EcsError::UnknownComponentType { type_id: type_id.0 })?;
        let slot = pool
            .insert_json(entity, value)
            .map_err(|e| EcsError::ComponentDeserializationError {
                component: name,
                details: e.to_string(),
            })?;
        match slot {
            Some((index, generation)) => Ok(ComponentRef {
                type_id,
                index,
                generation,
            }),
            None => Err(self.exhausted(type_id)),
        }
    }

    /// Free a component. Every copy of `component` is invalid afterwards.
    pub fn destroy(&mut self, component: ComponentRef) -> bool {
        let network_id = self.network_id(component);
        let removed = self
            .pool_mut(component.type_id)
            .is_some_and(|p| p.remove(component.index, component.generation));
        if removed {
            if let Some(network_id) = network_id {
                self.by_network.remove(&(component.type_id, network_id));
            }
        }
        removed
    }

    pub fn is_live(&self, component: ComponentRef) -> bool {
        self.pool(component.type_id)
            .is_some_and(|p| p.is_live(component.index, component.generation))
    }

    /// Find a component by type and network id.
    pub fn get(&self, type_id: ComponentTypeId, network_id: NetworkId) -> Option<ComponentRef> {
        self.by_network.get(&(type_id, network_id)).copied()
    }

    /// The entity that owns `component`.
    pub fn owner(&self, component: ComponentRef) -> Option<EntityId> {
        self.pool(component.type_id)?
            .owner(component.index, component.generation)
    }

    pub fn network_id(&self, component: ComponentRef) -> Option<NetworkId> {
        self.pool(component.type_id)?
            .network_id(component.index, component.generation)
    }

    /// Give a live component its network id.
    ///
    /// # Panics
    ///
    /// Panics if another live component of the same type already uses
    /// `network_id`.
    pub fn set_network_id(&mut self, component: ComponentRef, network_id: NetworkId) -> bool {
        let key = (component.type_id, network_id);
        if let Some(existing) = self.by_network.get(&key) {
            assert_eq!(
                *existing, component,
                "network id {network_id} already used by {existing:?}"
            );
            return true;
        }
        let set = self
            .pool_mut(component.type_id)
            .is_some_and(|p| p.set_network_id(component.index, component.generation, Some(network_id)));
        if set {
            self.by_network.insert(key, component);
        }
        set
    }

    pub fn get_value<T: Component>(&self, component: ComponentRef) -> Option<&T> {
        let (type_id, pool) = self.typed::<T>()?;
        if type_id != component.type_id {
            return None;
        }
        pool.get(component.index, component.generation)
            .map(|o| &o.value)
    }

    pub fn get_value_mut<T: Component>(&mut self, component: ComponentRef) -> Option<&mut T> {
        let (type_id, pool) = self.typed_mut::<T>()?;
        if type_id != component.type_id {
            return None;
        }
        pool.get_mut(component.index, component.generation)
            .map(|o| &mut o.value)
    }

    /// JSON form of a live component.
    pub fn serialize(&self, component: ComponentRef) -> Result<Value, EcsError> {
        let name = &self.info(component.type_id)?.name;
        let result = self
            .pool(component.type_id)
            .and_then(|p| p.to_json(component.index, component.generation))
            .ok_or(EcsError::StaleComponent { component })?;
        result.map_err(|e| EcsError::ComponentSerializationError {
            component: name.clone(),
            details: e.to_string(),
        })
    }

    /// Overwrite a live component from its JSON form.
    pub fn set_from_json(&mut self, component: ComponentRef, value: &Value) -> Result<(), EcsError> {
        let name = self.info(component.type_id)?.name.clone();
        let result = self
            .pool_mut(component.type_id)
            .and_then(|p| p.set_json(component.index, component.generation, value))
            .ok_or(EcsError::StaleComponent { component })?;
        result.map_err(|e| EcsError::ComponentDeserializationError {
            component: name,
            details: e.to_string(),
        })
    }

    /// Live components of one type, in slot order.
    pub fn live_refs(&self, type_id: ComponentTypeId) -> Vec<ComponentRef> {
        self.pool(type_id)
            .map(|p| {
                p.live_slots()
                    .into_iter()
                    .map(|(index, generation)| ComponentRef {
                        type_id,
                        index,
                        generation,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, type_id: ComponentTypeId) -> usize {
        self.pool(type_id).map_or(0, |p| p.len())
    }

    pub fn capacity(&self, type_id: ComponentTypeId) -> usize {
        self.pool(type_id).map_or(0, |p| p.capacity())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
