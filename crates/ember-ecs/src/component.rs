//! Component type registration and metadata.
//!
//! Every component type must be registered with a [`ComponentRegistry`]
//! before use. Registration assigns a [`ComponentTypeId`] in registration
//! order; peers replicating to each other must register the same types in
//! the same order, since the id is what goes on the wire.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Anything that can live in a component pool and be replicated.
pub trait Component: Clone + Serialize + DeserializeOwned + 'static {}

impl<T> Component for T where T: Clone + Serialize + DeserializeOwned + 'static {}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Runtime identifier of a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub u16);

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Id assigned at registration.
    pub id: ComponentTypeId,
    /// Name supplied by the caller, used in logs and snapshots.
    pub name: String,
    /// `std::any::type_name::<T>()`.
    pub rust_name: &'static str,
    /// Fixed pool capacity.
    pub capacity: usize,
    /// Rust `TypeId` for runtime type checks.
    pub type_id: TypeId,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Maps Rust types and names to [`ComponentTypeId`]s.
///
/// A Rust type can only be registered once; registering it again returns the
/// existing id and ignores the new name and capacity.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    by_name: HashMap<String, ComponentTypeId>,
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `name` with a pool of `capacity` slots.
    ///
    /// Returns the id and whether this call created it.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already taken by a different type, or if more
    /// than `u16::MAX` types are registered.
    pub fn register<T: Component>(&mut self, name: &str, capacity: usize) -> (ComponentTypeId, bool) {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return (existing, false);
        }
        if self.by_name.contains_key(name) {
            panic!(
                "component name '{}' is already registered for a different type",
                name
            );
        }

        let raw = u16::try_from(self.infos.len()).expect("component type id space exhausted");
        let id = ComponentTypeId(raw);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            rust_name: std::any::type_name::<T>(),
            capacity,
            type_id: rust_type_id,
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        (id, true)
    }

    /// Look up a component type by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.0 as usize)
    }

    /// Whether `id` was handed out by this registry.
    pub fn contains(&self, id: ComponentTypeId) -> bool {
        (id.0 as usize) < self.infos.len()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
