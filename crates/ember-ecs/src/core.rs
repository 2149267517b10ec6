//! The [`Core`] -- composition root that owns all ECS registries.
//!
//! Every gameplay mutation goes through `Core`. When a replication session
//! is open, changes to networked objects are mirrored into the recorder;
//! [`Core::end_replication`] hands them to a [`PacketSink`].
//!
//! `Core` is `!Send`; it lives on the game thread.

use std::collections::HashMap;

use ember_net::ids::{ConnectionId, NetworkId, NetworkIdAllocator};
use ember_net::interface::PacketSink;
use ember_net::NetError;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::config::{CoreConfig, DisconnectPolicy};
use crate::entity::{EntityId, EntityRecord, EntityRegistry};
use crate::ownership::{DeferredOp, OwnershipHub};
use crate::replication::{ObjectKind, ReplicationRecorder, ReplicationScope};
use crate::storage::{ComponentRef, ComponentStorage};
use crate::view::{ViewRef, ViewRegistry, ViewSnapshot, ViewTypeId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// PeerBindings
// ---------------------------------------------------------------------------

/// Two-way map between local connection ids and peer network ids.
#[derive(Debug, Default)]
struct PeerBindings {
    by_connection: HashMap<ConnectionId, NetworkId>,
    by_network: HashMap<NetworkId, ConnectionId>,
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

/// Owns the component, entity and view registries and the replication
/// recorder.
pub struct Core {
    config: CoreConfig,
    pub(crate) components: ComponentStorage,
    pub(crate) entities: EntityRegistry,
    pub(crate) views: ViewRegistry,
    pub(crate) network_ids: NetworkIdAllocator,
    recorder: ReplicationRecorder,
    pub(crate) ownership: OwnershipHub,
    peers: PeerBindings,
    /// Set while applying remote replication, which must not be re-recorded.
    pub(crate) replaying: bool,
}

impl Core {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            entities: EntityRegistry::new(config.max_entities),
            config,
            components: ComponentStorage::new(),
            views: ViewRegistry::new(),
            network_ids: NetworkIdAllocator::new(),
            recorder: ReplicationRecorder::new(),
            ownership: OwnershipHub::default(),
            peers: PeerBindings::default(),
            replaying: false,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Whether this core assigns network ids itself.
    pub fn is_authoritative(&self) -> bool {
        self.config.authoritative
    }

    /// A fresh network id, or `None` on a core that only mirrors ids.
    fn allocate_network_id(&mut self) -> Option<NetworkId> {
        self.config
            .authoritative
            .then(|| self.network_ids.allocate())
    }

    // -- registration -------------------------------------------------------

    /// Register `T` with the default pool capacity.
    pub fn register_component<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        let capacity = self.config.default_pool_capacity;
        self.components.register::<T>(name, capacity)
    }

    pub fn register_component_with_capacity<T: Component>(
        &mut self,
        name: &str,
        capacity: usize,
    ) -> ComponentTypeId {
        self.components.register::<T>(name, capacity)
    }

    /// Declare a view type over already registered component types.
    ///
    /// # Panics
    ///
    /// Panics if a required type is not registered or `name` is taken.
    pub fn register_view_type(&mut self, name: &str, required: &[ComponentTypeId]) -> ViewTypeId {
        for &type_id in required {
            assert!(
                self.components.registry().contains(type_id),
                "view type '{name}' requires unregistered component {type_id:?}"
            );
        }
        self.views.register_view_type(name, required)
    }

    pub fn registry(&self) -> &ComponentRegistry {
        self.components.registry()
    }

    pub fn storage(&self) -> &ComponentStorage {
        &self.components
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn ownership(&self) -> &OwnershipHub {
        &self.ownership
    }

    /// Type id of `T`, or `UnknownComponent` listing what is registered.
    pub fn component_type<T: Component>(&self) -> Result<ComponentTypeId, EcsError> {
        self.registry()
            .lookup::<T>()
            .ok_or_else(|| EcsError::UnknownComponent {
                name: std::any::type_name::<T>().to_owned(),
                registered: self.registry().registered_names().join(", "),
            })
    }

    // -- diagnostics --------------------------------------------------------

    /// Short name of a type, as registered.
    pub fn type_name(&self, kind: ObjectKind, type_id: u16) -> Option<&str> {
        match kind {
            ObjectKind::Entity => Some("entity"),
            ObjectKind::Component => self
                .registry()
                .get_info(ComponentTypeId(type_id))
                .map(|i| i.name.as_str()),
            ObjectKind::View => self
                .views
                .info(ViewTypeId(type_id))
                .map(|i| i.name.as_str()),
        }
    }

    /// Fully qualified name: the Rust type for components, the required
    /// component names for views.
    pub fn full_type_name(&self, kind: ObjectKind, type_id: u16) -> Option<String> {
        match kind {
            ObjectKind::Entity => Some(std::any::type_name::<EntityRecord>().to_owned()),
            ObjectKind::Component => self
                .registry()
                .get_info(ComponentTypeId(type_id))
                .map(|i| i.rust_name.to_owned()),
            ObjectKind::View => {
                let info = self.views.info(ViewTypeId(type_id))?;
                let required: Vec<&str> = info
                    .required
                    .iter()
                    .filter_map(|t| self.registry().get_info(*t).map(|i| i.name.as_str()))
                    .collect();
                Some(format!("{}<{}>", info.name, required.join(", ")))
            }
        }
    }

    // -- peers --------------------------------------------------------------

    /// Record that `connection` is the peer known everywhere as `network_id`.
    pub fn bind_peer(&mut self, connection: ConnectionId, network_id: NetworkId) {
        self.unbind_peer(connection);
        self.peers.by_connection.insert(connection, network_id);
        self.peers.by_network.insert(network_id, connection);
    }

    pub fn unbind_peer(&mut self, connection: ConnectionId) -> Option<NetworkId> {
        let network_id = self.peers.by_connection.remove(&connection)?;
        self.peers.by_network.remove(&network_id);
        Some(network_id)
    }

    pub fn peer_network_id(&self, connection: ConnectionId) -> Option<NetworkId> {
        self.peers.by_connection.get(&connection).copied()
    }

    pub fn peer_connection(&self, network_id: NetworkId) -> Option<ConnectionId> {
        self.peers.by_network.get(&network_id).copied()
    }

    pub(crate) fn owner_peer(&self, owner: Option<ConnectionId>) -> Option<NetworkId> {
        owner.and_then(|c| self.peer_network_id(c))
    }

    // -- entities -----------------------------------------------------------

    /// Create a local-only entity.
    pub fn create_entity(&mut self) -> Result<EntityId, EcsError> {
        self.entities.create()
    }

    /// Create an entity with a fresh network id and record its creation.
    ///
    /// On a non-authoritative core the entity stays local.
    pub fn create_networked_entity(&mut self) -> Result<EntityId, EcsError> {
        let entity = self.entities.create()?;
        let Some(network_id) = self.allocate_network_id() else {
            debug!(entity = %entity, "not authoritative, entity stays local");
            return Ok(entity);
        };
        self.entities.set_network_id(entity, network_id)?;
        if let Some(recorder) = self.recording() {
            recorder
                .replicate_create(ObjectKind::Entity, 0, network_id)
                .payload = json!({ "owner": null });
        }
        debug!(entity = %entity, network_id = %network_id, "networked entity created");
        Ok(entity)
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.is_alive(entity)
    }

    pub fn entity(&self, entity: EntityId) -> Option<&EntityRecord> {
        self.entities.get(entity)
    }

    pub fn entity_by_network_id(&self, network_id: NetworkId) -> Option<EntityId> {
        self.entities.by_network_id(network_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Destroy `entity` with all of its components and views.
    ///
    /// Called from an ownership handler on the entity being reported, the
    /// destroy is deferred until every handler has seen the event.
    pub fn destroy_entity(&mut self, entity: EntityId) -> Result<(), EcsError> {
        if !self.entities.is_alive(entity) {
            return Err(EcsError::StaleEntity { entity });
        }
        if self.ownership.current() == Some(entity) {
            self.ownership.defer(DeferredOp::DestroyEntity(entity));
            return Ok(());
        }
        let record = self
            .entities
            .remove(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        for component in record.components.values() {
            self.components.destroy(*component);
        }
        for view in &record.views {
            if let Err(error) = self.views.destroy(*view) {
                warn!(entity = %entity, view = ?view, %error, "entity listed a dead view");
            }
        }
        if let Some(network_id) = record.network_id {
            if let Some(recorder) = self.recording() {
                recorder.replicate_destroy(ObjectKind::Entity, 0, network_id);
            }
        }
        debug!(entity = %entity, "entity destroyed");
        Ok(())
    }

    /// Destroy or orphan every entity `connection` owns.
    ///
    /// Returns the affected entities.
    pub fn release_connection(
        &mut self,
        connection: ConnectionId,
        policy: DisconnectPolicy,
    ) -> Result<Vec<EntityId>, EcsError> {
        let owned = self.entities.owned_by(connection);
        for &entity in &owned {
            // An earlier release step (an ownership handler) may have
            // destroyed it already.
            if !self.entities.is_alive(entity) {
                continue;
            }
            match policy {
                DisconnectPolicy::Destroy => self.destroy_entity(entity)?,
                DisconnectPolicy::Orphan => {
                    self.set_owner(entity, None)?;
                }
            }
        }
        if !owned.is_empty() {
            info!(
                connection = %connection,
                count = owned.len(),
                ?policy,
                "released entities of departed connection"
            );
        }
        Ok(owned)
    }

    // -- components ---------------------------------------------------------

    /// Attach a new `T` to `entity`.
    ///
    /// Fails with `DuplicateComponent` if the entity already has one, and
    /// with `PoolExhausted` if the pool is full.
    pub fn add_component<T: Component>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<ComponentRef, EcsError> {
        let type_id = self.component_type::<T>()?;
        let record = self
            .entities
            .get(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        if record.components.contains_key(&type_id) {
            return Err(self.duplicate(entity, type_id));
        }
        let entity_network_id = record.network_id;

        let component = self.components.create(entity, value)?;
        self.entities
            .record_mut(entity)?
            .components
            .insert(type_id, component);

        let network_id = entity_network_id.and_then(|_| self.allocate_network_id());
        if let (Some(entity_network_id), Some(network_id)) = (entity_network_id, network_id) {
            self.components.set_network_id(component, network_id);
            if self.recording().is_some() {
                let payload = self.components.serialize(component)?;
                if let Some(recorder) = self.recording() {
                    let packet =
                        recorder.replicate_create(ObjectKind::Component, type_id.0, network_id);
                    packet.entity = entity_network_id;
                    packet.payload = payload;
                }
            }
        }
        self.refresh_views(entity)?;
        Ok(component)
    }

    /// Overwrite `entity`'s `T`, adding it if missing.
    pub fn set_component<T: Component>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<ComponentRef, EcsError> {
        let type_id = self.component_type::<T>()?;
        match self.component_ref(entity, type_id) {
            Some(component) => {
                if let Some(slot) = self.components.get_value_mut::<T>(component) {
                    *slot = value;
                }
                self.record_update(component)?;
                Ok(component)
            }
            None => self.add_component(entity, value),
        }
    }

    /// Mutate `entity`'s `T` in place and record the change.
    pub fn modify_component<T: Component, R>(
        &mut self,
        entity: EntityId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, EcsError> {
        let type_id = self.component_type::<T>()?;
        let component = self
            .component_ref(entity, type_id)
            .ok_or_else(|| self.missing(entity, type_id))?;
        let value = self
            .components
            .get_value_mut::<T>(component)
            .ok_or(EcsError::StaleComponent { component })?;
        let result = f(value);
        self.record_update(component)?;
        Ok(result)
    }

    /// Record an update for a component changed through
    /// [`get_component_mut`](Self::get_component_mut).
    pub fn mark_changed(&mut self, entity: EntityId, type_id: ComponentTypeId) -> Result<(), EcsError> {
        let component = self
            .component_ref(entity, type_id)
            .ok_or_else(|| self.missing(entity, type_id))?;
        self.record_update(component)
    }

    /// Detach and destroy `entity`'s component of `type_id`.
    pub fn remove_component(&mut self, entity: EntityId, type_id: ComponentTypeId) -> Result<(), EcsError> {
        let record = self.entities.record_mut(entity)?;
        let entity_network_id = record.network_id;
        let component = match record.components.remove(&type_id) {
            Some(component) => component,
            None => return Err(self.missing(entity, type_id)),
        };
        let network_id = self.components.network_id(component);
        self.components.destroy(component);
        if let (Some(network_id), Some(entity_network_id)) = (network_id, entity_network_id) {
            if let Some(recorder) = self.recording() {
                if let Some(packet) =
                    recorder.replicate_destroy(ObjectKind::Component, type_id.0, network_id)
                {
                    packet.entity = entity_network_id;
                }
            }
        }
        self.refresh_views(entity)
    }

    pub fn get_component<T: Component>(&self, entity: EntityId) -> Option<&T> {
        let type_id = self.registry().lookup::<T>()?;
        let component = self.component_ref(entity, type_id)?;
        self.components.get_value::<T>(component)
    }

    /// Mutable access without recording; follow with
    /// [`mark_changed`](Self::mark_changed) for networked entities.
    pub fn get_component_mut<T: Component>(&mut self, entity: EntityId) -> Option<&mut T> {
        let type_id = self.registry().lookup::<T>()?;
        let component = self.component_ref(entity, type_id)?;
        self.components.get_value_mut::<T>(component)
    }

    pub fn component_ref(&self, entity: EntityId, type_id: ComponentTypeId) -> Option<ComponentRef> {
        self.entities.get(entity)?.component(type_id)
    }

    /// Find a component by type and network id.
    pub fn component_by_network_id(
        &self,
        type_id: ComponentTypeId,
        network_id: NetworkId,
    ) -> Option<ComponentRef> {
        self.components.get(type_id, network_id)
    }

    fn record_update(&mut self, component: ComponentRef) -> Result<(), EcsError> {
        if self.recording().is_none() {
            return Ok(());
        }
        let Some(network_id) = self.components.network_id(component) else {
            return Ok(());
        };
        let entity_network_id = self
            .components
            .owner(component)
            .and_then(|e| self.entities.get(e))
            .and_then(|r| r.network_id)
            .unwrap_or(NetworkId::NONE);
        let payload = self.components.serialize(component)?;
        if let Some(recorder) = self.recording() {
            if let Some(packet) =
                recorder.replicate_update(ObjectKind::Component, component.type_id.0, network_id)
            {
                packet.entity = entity_network_id;
                packet.payload = payload;
            }
        }
        Ok(())
    }

    fn duplicate(&self, entity: EntityId, type_id: ComponentTypeId) -> EcsError {
        EcsError::DuplicateComponent {
            entity,
            component: self.component_name(type_id),
        }
    }

    fn missing(&self, entity: EntityId, type_id: ComponentTypeId) -> EcsError {
        EcsError::MissingComponent {
            entity,
            component: self.component_name(type_id),
        }
    }

    fn component_name(&self, type_id: ComponentTypeId) -> String {
        self.registry()
            .get_info(type_id)
            .map_or_else(|| format!("#{}", type_id.0), |i| i.name.clone())
    }

    // -- views --------------------------------------------------------------

    /// Create a view of `view_type` and attach it to `entity`.
    pub fn add_view(&mut self, entity: EntityId, view_type: ViewTypeId) -> Result<ViewRef, EcsError> {
        let entity_network_id = self
            .entities
            .get(entity)
            .ok_or(EcsError::StaleEntity { entity })?
            .network_id;
        let view = self.views.create(view_type)?;
        self.views.attach(view, entity)?;
        self.entities.record_mut(entity)?.views.push(view);

        let network_id = entity_network_id.and_then(|_| self.allocate_network_id());
        if let (Some(entity_network_id), Some(network_id)) = (entity_network_id, network_id) {
            self.views.set_network_id(view, network_id)?;
            if let Some(recorder) = self.recording() {
                recorder
                    .replicate_create(ObjectKind::View, view_type.0, network_id)
                    .entity = entity_network_id;
            }
        }
        self.refresh_views(entity)?;
        Ok(view)
    }

    /// Detach and destroy a view.
    pub fn remove_view(&mut self, view: ViewRef) -> Result<(), EcsError> {
        let network_id = self.views.network_id(view);
        let entity = self.views.destroy(view)?;
        let mut entity_network_id = None;
        if let Some(record) = entity.and_then(|e| self.entities.get_mut(e)) {
            record.views.retain(|v| *v != view);
            entity_network_id = record.network_id;
        }
        if let (Some(network_id), Some(entity_network_id)) = (network_id, entity_network_id) {
            if let Some(recorder) = self.recording() {
                if let Some(packet) =
                    recorder.replicate_destroy(ObjectKind::View, view.type_id.0, network_id)
                {
                    packet.entity = entity_network_id;
                }
            }
        }
        Ok(())
    }

    /// Every live view of `view_type`, satisfied or not.
    pub fn get_all_of_type(&self, view_type: ViewTypeId) -> ViewSnapshot {
        self.views.get_all_of_type(view_type)
    }

    pub fn is_satisfied(&self, view: ViewRef) -> bool {
        self.views.is_satisfied(view)
    }

    pub fn view_entity(&self, view: ViewRef) -> Option<EntityId> {
        self.views.entity_of(view)
    }

    /// A satisfied view's `T`. `None` when the view is stale or unsatisfied.
    ///
    /// # Panics
    ///
    /// Panics if the view is satisfied, requires `T`, and `T` is missing:
    /// satisfaction bookkeeping is broken.
    pub fn view_component<T: Component>(&self, view: ViewRef) -> Option<&T> {
        let component = self.view_component_ref::<T>(view)?;
        self.components.get_value::<T>(component)
    }

    pub fn view_component_mut<T: Component>(&mut self, view: ViewRef) -> Option<&mut T> {
        let component = self.view_component_ref::<T>(view)?;
        self.components.get_value_mut::<T>(component)
    }

    fn view_component_ref<T: Component>(&self, view: ViewRef) -> Option<ComponentRef> {
        if !self.views.is_satisfied(view) {
            return None;
        }
        let entity = self.views.entity_of(view)?;
        let type_id = self.registry().lookup::<T>()?;
        let found = self
            .component_ref(entity, type_id)
            .filter(|c| self.components.is_live(*c));
        let required = self.views.required(view.type_id).any(|t| t == type_id);
        if required && found.is_none() {
            panic!(
                "view {view:?} is satisfied but entity {entity} has no '{}'",
                self.component_name(type_id)
            );
        }
        found
    }

    /// Recompute satisfaction of every view on `entity`.
    pub(crate) fn refresh_views(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let record = self
            .entities
            .get(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        let mut changes = Vec::with_capacity(record.views.len());
        for &view in &record.views {
            let satisfied = self.views.required(view.type_id).all(|t| {
                record
                    .component(t)
                    .is_some_and(|c| self.components.is_live(c))
            });
            changes.push((view, satisfied));
        }
        for (view, satisfied) in changes {
            let before = self.views.set_satisfied(view, satisfied)?;
            if before != satisfied {
                debug!(entity = %entity, ?view, satisfied, "view satisfaction changed");
            }
        }
        Ok(())
    }

    // -- replication --------------------------------------------------------

    /// Open a replication session.
    ///
    /// # Panics
    ///
    /// Panics if one is already open.
    pub fn begin_replication(&mut self) {
        self.recorder.begin();
    }

    /// Close the session and broadcast what it recorded to every peer not in
    /// `except`. A no-op when no session is open.
    pub fn end_replication<S: PacketSink + ?Sized>(
        &mut self,
        sink: &mut S,
        except: &[ConnectionId],
    ) -> Result<usize, NetError> {
        self.recorder.end(sink, except)
    }

    /// Open a session that ends when the returned guard is finished or
    /// dropped.
    pub fn replication_scope<'a, S: PacketSink>(
        &'a mut self,
        sink: &'a mut S,
        except: &[ConnectionId],
    ) -> ReplicationScope<'a, S> {
        ReplicationScope::new(self, sink, except)
    }

    /// Close the session without sending anything.
    pub fn discard_replication(&mut self) -> Vec<crate::replication::ReplicationPacket> {
        self.recorder.discard()
    }

    pub fn is_replicating(&self) -> bool {
        self.recorder.is_open()
    }

    pub fn recorder(&self) -> &ReplicationRecorder {
        &self.recorder
    }

    /// The recorder, when changes should be recorded right now.
    pub(crate) fn recording(&mut self) -> Option<&mut ReplicationRecorder> {
        (self.recorder.is_open() && !self.replaying).then_some(&mut self.recorder)
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Transform {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);

    fn setup() -> (Core, ComponentTypeId, ComponentTypeId) {
        let mut core = Core::default();
        let t = core.register_component::<Transform>("transform");
        let h = core.register_component_with_capacity::<Health>("health", 2);
        (core, t, h)
    }

    #[test]
    fn add_get_modify_remove() {
        let (mut core, t, _) = setup();
        let e = core.create_entity().unwrap();
        core.add_component(e, Transform { x: 1.0, y: 2.0 }).unwrap();
        core.modify_component::<Transform, _>(e, |tr| tr.x = 5.0).unwrap();
        assert_eq!(
            core.get_component::<Transform>(e),
            Some(&Transform { x: 5.0, y: 2.0 })
        );
        core.remove_component(e, t).unwrap();
        assert!(core.get_component::<Transform>(e).is_none());
        assert!(matches!(
            core.remove_component(e, t),
            Err(EcsError::MissingComponent { .. })
        ));
    }

    #[test]
    fn one_component_per_type() {
        let (mut core, _, _) = setup();
        let e = core.create_entity().unwrap();
        core.add_component(e, Health(1)).unwrap();
        let err = core.add_component(e, Health(2)).unwrap_err();
        assert!(matches!(err, EcsError::DuplicateComponent { ref component, .. } if component == "health"));
        core.set_component(e, Health(3)).unwrap();
        assert_eq!(core.get_component::<Health>(e), Some(&Health(3)));
    }

    #[test]
    fn destroy_cascades_to_components_and_views() {
        let (mut core, t, h) = setup();
        let view_type = core.register_view_type("living", &[t, h]);
        let e = core.create_entity().unwrap();
        let tr = core.add_component(e, Transform { x: 0.0, y: 0.0 }).unwrap();
        let hp = core.add_component(e, Health(10)).unwrap();
        let view = core.add_view(e, view_type).unwrap();
        assert!(core.is_satisfied(view));

        core.destroy_entity(e).unwrap();
        assert!(!core.storage().is_live(tr));
        assert!(!core.storage().is_live(hp));
        assert!(!core.views().is_live(view));
        assert!(core.get_all_of_type(view_type).is_empty());
        assert_eq!(core.storage().len(h), 0);
    }

    #[test]
    fn unregistered_component_lists_registered_names() {
        let mut core = Core::default();
        core.register_component::<Health>("health");
        let e = core.create_entity().unwrap();
        let err = core.add_component(e, Transform { x: 0.0, y: 0.0 }).unwrap_err();
        assert!(
            matches!(err, EcsError::UnknownComponent { ref registered, .. } if registered == "health")
        );
    }

    #[test]
    fn type_names_for_diagnostics() {
        let (mut core, t, h) = setup();
        let v = core.register_view_type("living", &[t, h]);
        assert_eq!(core.type_name(ObjectKind::Component, t.0), Some("transform"));
        assert_eq!(core.type_name(ObjectKind::View, v.0), Some("living"));
        assert!(core
            .full_type_name(ObjectKind::Component, h.0)
            .unwrap()
            .ends_with("Health"));
        assert_eq!(
            core.full_type_name(ObjectKind::View, v.0).as_deref(),
            Some("living<transform, health>")
        );
        assert_eq!(core.type_name(ObjectKind::Component, 99), None);
    }

    #[test]
    fn release_connection_orphans_or_destroys() {
        let (mut core, _, _) = setup();
        let a = core.create_entity().unwrap();
        let b = core.create_entity().unwrap();
        let c = core.create_entity().unwrap();
        core.set_owner(a, Some(ConnectionId(5))).unwrap();
        core.set_owner(b, Some(ConnectionId(5))).unwrap();
        core.set_owner(c, Some(ConnectionId(6))).unwrap();

        let orphaned = core
            .release_connection(ConnectionId(5), DisconnectPolicy::Orphan)
            .unwrap();
        assert_eq!(orphaned, vec![a, b]);
        assert_eq!(core.entity(a).unwrap().owner, None);

        core.release_connection(ConnectionId(6), DisconnectPolicy::Destroy)
            .unwrap();
        assert!(!core.is_alive(c));
        assert!(core.is_alive(a));
    }

    #[test]
    fn peer_bindings_are_two_way() {
        let mut core = Core::default();
        core.bind_peer(ConnectionId(3), NetworkId(40));
        assert_eq!(core.peer_connection(NetworkId(40)), Some(ConnectionId(3)));
        core.bind_peer(ConnectionId(3), NetworkId(41));
        assert_eq!(core.peer_connection(NetworkId(40)), None);
        assert_eq!(core.unbind_peer(ConnectionId(3)), Some(NetworkId(41)));
        assert_eq!(core.peer_network_id(ConnectionId(3)), None);
    }
}
