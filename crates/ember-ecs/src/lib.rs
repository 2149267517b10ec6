//! Ember ECS -- entities, fixed-capacity component pools, views and
//! replication.
//!
//! Components live in preallocated pools, one per registered type, and are
//! addressed by generational handles. Views name a set of required component
//! types and are satisfied exactly when their entity holds all of them.
//! The [`Core`](core::Core) owns everything and mirrors changes to networked
//! objects into replication packets while a session is open.
//!
//! # Quick Start
//!
//! ```
//! use ember_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Transform { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Camera { fov: f32 }
//!
//! let mut core = Core::default();
//! let transform = core.register_component::<Transform>("transform");
//! let camera = core.register_component_with_capacity::<Camera>("camera", 1);
//! let view_type = core.register_view_type("camera_rig", &[transform, camera]);
//!
//! let entity = core.create_entity().unwrap();
//! let view = core.add_view(entity, view_type).unwrap();
//! core.add_component(entity, Transform { x: 0.0, y: 0.0 }).unwrap();
//! assert!(!core.is_satisfied(view));
//! core.add_component(entity, Camera { fov: 90.0 }).unwrap();
//! assert!(core.is_satisfied(view));
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod config;
pub mod core;
pub mod entity;
pub mod ownership;
pub mod remote;
pub mod replication;
pub mod snapshot;
pub mod storage;
pub mod view;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },

    /// The component slot was freed.
    #[error("component {component:?} no longer exists")]
    StaleComponent { component: storage::ComponentRef },

    /// The view instance was destroyed.
    #[error("view {view:?} no longer exists")]
    StaleView { view: view::ViewRef },

    /// A Rust type was used as a component without being registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// A component type id that this core never handed out.
    #[error("unknown component type id {type_id}")]
    UnknownComponentType { type_id: u16 },

    /// A view type id that this core never handed out.
    #[error("unknown view type id {type_id}")]
    UnknownViewType { type_id: u16 },

    /// Every slot in the component's pool is in use.
    #[error("component pool '{component}' exhausted (capacity {capacity})")]
    PoolExhausted { component: String, capacity: usize },

    /// `CoreConfig::max_entities` entities are alive.
    #[error("entity limit of {limit} reached")]
    EntityLimitReached { limit: usize },

    #[error("entity {entity:?} already has a '{component}' component")]
    DuplicateComponent {
        entity: entity::EntityId,
        component: String,
    },

    #[error("entity {entity:?} has no '{component}' component")]
    MissingComponent {
        entity: entity::EntityId,
        component: String,
    },

    /// A replicated object id is not known here.
    #[error("no {kind:?} with network id {network_id}")]
    UnknownNetworkId {
        kind: replication::ObjectKind,
        network_id: ember_net::ids::NetworkId,
    },

    /// A replication payload has the wrong shape.
    #[error("invalid payload for {kind:?} {network_id}: {details}")]
    InvalidPayload {
        kind: replication::ObjectKind,
        network_id: ember_net::ids::NetworkId,
        details: String,
    },

    /// Serialization of a component value failed.
    #[error("failed to serialize component '{component}': {details}")]
    ComponentSerializationError { component: String, details: String },

    /// Deserialization of a component value failed.
    #[error("failed to deserialize component '{component}': {details}")]
    ComponentDeserializationError { component: String, details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId};
    pub use crate::config::{CoreConfig, DisconnectPolicy};
    pub use crate::core::Core;
    pub use crate::entity::{EntityId, EntityRecord};
    pub use crate::ownership::{ApplyReport, DeferredOp, OwnershipChanged};
    pub use crate::replication::{
        ObjectKind, ReplicationAction, ReplicationPacket, ReplicationRecorder, ReplicationScope,
    };
    pub use crate::snapshot::{CoreSnapshot, EntitySnapshot};
    pub use crate::storage::{ComponentPool, ComponentRef, ComponentStorage};
    pub use crate::view::{ViewRef, ViewSnapshot, ViewTypeId, ViewTypeInfo};
    pub use crate::EcsError;
}
