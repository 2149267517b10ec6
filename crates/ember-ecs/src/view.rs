//! View types and view instances.
//!
//! A view type is a name plus a fixed set of required component types. A
//! view instance attaches to one entity and is *satisfied* exactly when that
//! entity owns a live component of every required type. Satisfaction is
//! recomputed by [`Core`](crate::core::Core) on every component add and
//! remove; this module only stores the result.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use ember_net::ids::NetworkId;

use crate::component::ComponentTypeId;
use crate::entity::EntityId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Ids and handles
// ---------------------------------------------------------------------------

/// Runtime identifier of a registered view type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewTypeId(pub u16);

impl fmt::Debug for ViewTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewTypeId({})", self.0)
    }
}

/// Handle to one view instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewRef {
    pub type_id: ViewTypeId,
    pub index: u32,
    pub generation: u32,
}

impl fmt::Debug for ViewRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ViewRef({}:{}v{})",
            self.type_id.0, self.index, self.generation
        )
    }
}

/// Metadata about a registered view type.
#[derive(Debug, Clone)]
pub struct ViewTypeInfo {
    pub id: ViewTypeId,
    pub name: String,
    pub required: BTreeSet<ComponentTypeId>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct ViewInstance {
    entity: Option<EntityId>,
    satisfied: bool,
    network_id: Option<NetworkId>,
}

#[derive(Debug, Default)]
struct ViewSlot {
    generation: u32,
    instance: Option<ViewInstance>,
}

/// Growable generational slots for one view type.
#[derive(Debug, Default)]
struct ViewPool {
    slots: Vec<ViewSlot>,
    free: VecDeque<u32>,
}

impl ViewPool {
    fn insert(&mut self) -> (u32, u32) {
        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                self.slots.push(ViewSlot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.instance = Some(ViewInstance::default());
        (index, slot.generation)
    }

    fn get(&self, index: u32, generation: u32) -> Option<&ViewInstance> {
        let slot = self.slots.get(index as usize)?;
        (slot.generation == generation)
            .then_some(slot.instance.as_ref())
            .flatten()
    }

    fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut ViewInstance> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.instance.as_mut()
    }

    fn remove(&mut self, index: u32, generation: u32) -> Option<ViewInstance> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let instance = slot.instance.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(index);
        Some(instance)
    }
}

// ---------------------------------------------------------------------------
// ViewSnapshot
// ---------------------------------------------------------------------------

/// The live views of one type at the moment it was taken.
///
/// Iterating does not consume the snapshot, so it can be walked any number
/// of times. Views destroyed after the snapshot was taken still appear in it
/// and simply fail to resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewSnapshot {
    views: Vec<ViewRef>,
}

impl ViewSnapshot {
    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'_, ViewRef>> {
        self.views.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn as_slice(&self) -> &[ViewRef] {
        &self.views
    }
}

impl<'a> IntoIterator for &'a ViewSnapshot {
    type Item = ViewRef;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, ViewRef>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for ViewSnapshot {
    type Item = ViewRef;
    type IntoIter = std::vec::IntoIter<ViewRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.views.into_iter()
    }
}

// ---------------------------------------------------------------------------
// ViewRegistry
// ---------------------------------------------------------------------------

/// View types and all view instances.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    types: Vec<ViewTypeInfo>,
    by_name: HashMap<String, ViewTypeId>,
    pools: Vec<ViewPool>,
    by_network: HashMap<(ViewTypeId, NetworkId), ViewRef>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a view type requiring every type in `required`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register_view_type(&mut self, name: &str, required: &[ComponentTypeId]) -> ViewTypeId {
        assert!(
            !self.by_name.contains_key(name),
            "view type '{name}' is already registered"
        );
        let raw = u16::try_from(self.types.len()).expect("view type id space exhausted");
        let id = ViewTypeId(raw);
        self.types.push(ViewTypeInfo {
            id,
            name: name.to_owned(),
            required: required.iter().copied().collect(),
        });
        self.pools.push(ViewPool::default());
        self.by_name.insert(name.to_owned(), id);
        id
    }

    pub fn info(&self, type_id: ViewTypeId) -> Option<&ViewTypeInfo> {
        self.types.get(type_id.0 as usize)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<ViewTypeId> {
        self.by_name.get(name).copied()
    }

    /// Required component types of `type_id`; empty for unknown types.
    pub fn required(&self, type_id: ViewTypeId) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.info(type_id)
            .into_iter()
            .flat_map(|info| info.required.iter().copied())
    }

    /// Create an unattached, unsatisfied view instance.
    pub fn create(&mut self, type_id: ViewTypeId) -> Result<ViewRef, EcsError> {
        let pool = self
            .pools
            .get_mut(type_id.0 as usize)
            .ok_or(EcsError::UnknownViewType { type_id: type_id.0 })?;
        let (index, generation) = pool.insert();
        Ok(ViewRef {
            type_id,
            index,
            generation,
        })
    }

    /// Destroy a view instance. Returns the entity it was attached to.
    pub fn destroy(&mut self, view: ViewRef) -> Result<Option<EntityId>, EcsError> {
        let instance = self
            .pools
            .get_mut(view.type_id.0 as usize)
            .and_then(|p| p.remove(view.index, view.generation))
            .ok_or(EcsError::StaleView { view })?;
        if let Some(network_id) = instance.network_id {
            self.by_network.remove(&(view.type_id, network_id));
        }
        Ok(instance.entity)
    }

    fn instance(&self, view: ViewRef) -> Option<&ViewInstance> {
        self.pools
            .get(view.type_id.0 as usize)?
            .get(view.index, view.generation)
    }

    fn instance_mut(&mut self, view: ViewRef) -> Result<&mut ViewInstance, EcsError> {
        self.pools
            .get_mut(view.type_id.0 as usize)
            .and_then(|p| p.get_mut(view.index, view.generation))
            .ok_or(EcsError::StaleView { view })
    }

    pub fn is_live(&self, view: ViewRef) -> bool {
        self.instance(view).is_some()
    }

    /// Attach `view` to `entity`. A view attaches at most once.
    pub fn attach(&mut self, view: ViewRef, entity: EntityId) -> Result<(), EcsError> {
        let instance = self.instance_mut(view)?;
        assert!(
            instance.entity.is_none(),
            "view {view:?} is already attached to {:?}",
            instance.entity
        );
        instance.entity = Some(entity);
        Ok(())
    }

    pub fn entity_of(&self, view: ViewRef) -> Option<EntityId> {
        self.instance(view)?.entity
    }

    /// Store a recomputed satisfaction. Returns the previous value.
    pub fn set_satisfied(&mut self, view: ViewRef, satisfied: bool) -> Result<bool, EcsError> {
        let instance = self.instance_mut(view)?;
        Ok(std::mem::replace(&mut instance.satisfied, satisfied))
    }

    /// `false` for stale handles.
    pub fn is_satisfied(&self, view: ViewRef) -> bool {
        self.instance(view).is_some_and(|i| i.satisfied)
    }

    pub fn network_id(&self, view: ViewRef) -> Option<NetworkId> {
        self.instance(view)?.network_id
    }

    pub fn set_network_id(&mut self, view: ViewRef, network_id: NetworkId) -> Result<(), EcsError> {
        let key = (view.type_id, network_id);
        if let Some(existing) = self.by_network.get(&key) {
            assert_eq!(
                *existing, view,
                "network id {network_id} already used by {existing:?}"
            );
        }
        self.instance_mut(view)?.network_id = Some(network_id);
        self.by_network.insert(key, view);
        Ok(())
    }

    /// Find a view instance by type and network id.
    pub fn get(&self, type_id: ViewTypeId, network_id: NetworkId) -> Option<ViewRef> {
        self.by_network.get(&(type_id, network_id)).copied()
    }

    /// Every live instance of `type_id`, satisfied or not, in slot order.
    pub fn get_all_of_type(&self, type_id: ViewTypeId) -> ViewSnapshot {
        let views = self
            .pools
            .get(type_id.0 as usize)
            .map(|pool| {
                pool.slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.instance.is_some())
                    .map(|(index, s)| ViewRef {
                        type_id,
                        index: index as u32,
                        generation: s.generation,
                    })
                    .collect()
            })
            .unwrap_or_default();
        ViewSnapshot { views }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
