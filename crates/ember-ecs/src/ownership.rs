//! Ownership-changed notifications and deferred mutations.
//!
//! [`Core::set_owner`] broadcasts an [`OwnershipChanged`] event to every
//! registered handler. Handlers receive `&mut Core` and may mutate freely,
//! with two rules enforced here:
//!
//! - A `set_owner` issued from inside a handler is applied at once but its
//!   event is queued and delivered after the current broadcast finishes, so
//!   handlers never nest.
//! - Destroying the entity whose event is being broadcast is deferred until
//!   every handler has seen the event. Events still queued for an entity
//!   that is gone by the time they come up are skipped.

use std::collections::VecDeque;

use ember_net::ids::{ConnectionId, NetworkId};
use serde_json::json;
use tracing::{debug, warn};

use crate::core::Core;
use crate::entity::EntityId;
use crate::replication::ObjectKind;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Reported whenever [`Core::set_owner`] succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChanged {
    pub kind: ObjectKind,
    /// Type id within `kind`; `0` for entities.
    pub type_id: u16,
    pub entity: EntityId,
    pub network_id: Option<NetworkId>,
    pub previous: Option<ConnectionId>,
    pub owner: Option<ConnectionId>,
}

pub type OwnershipHandler = Box<dyn FnMut(&mut Core, &OwnershipChanged)>;

// ---------------------------------------------------------------------------
// Deferred mutations
// ---------------------------------------------------------------------------

/// A mutation postponed until the current broadcast completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredOp {
    DestroyEntity(EntityId),
}

/// Summary of the last deferred flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub success_count: usize,
    /// Ops whose target was already gone.
    pub failed_count: usize,
}

/// FIFO of deferred ops.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    ops: Vec<DeferredOp>,
    last_report: ApplyReport,
}

impl DeferredQueue {
    pub fn push(&mut self, op: DeferredOp) {
        if !self.ops.contains(&op) {
            self.ops.push(op);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn last_report(&self) -> &ApplyReport {
        &self.last_report
    }

    fn take(&mut self) -> Vec<DeferredOp> {
        std::mem::take(&mut self.ops)
    }
}

// ---------------------------------------------------------------------------
// OwnershipHub
// ---------------------------------------------------------------------------

/// Handler list plus broadcast state. Lives inside [`Core`].
#[derive(Default)]
pub struct OwnershipHub {
    handlers: Vec<OwnershipHandler>,
    pending: VecDeque<OwnershipChanged>,
    dispatching: bool,
    current: Option<EntityId>,
    deferred: DeferredQueue,
}

impl OwnershipHub {
    /// Entity whose event handlers are running right now.
    pub fn current(&self) -> Option<EntityId> {
        self.current
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub(crate) fn defer(&mut self, op: DeferredOp) {
        debug!(?op, "mutation deferred until broadcast completes");
        self.deferred.push(op);
    }
}

// ---------------------------------------------------------------------------
// Core integration
// ---------------------------------------------------------------------------

impl Core {
    /// Subscribe to ownership changes.
    ///
    /// Handlers added while a broadcast is running start receiving events
    /// from the next broadcast on.
    pub fn on_ownership_changed<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Core, &OwnershipChanged) + 'static,
    {
        self.ownership.handlers.push(Box::new(handler));
    }

    /// Hand `entity` to `owner` (or to nobody) and notify handlers.
    ///
    /// Returns the previous owner. Networked entities record an update when
    /// a replication session is open.
    pub fn set_owner(
        &mut self,
        entity: EntityId,
        owner: Option<ConnectionId>,
    ) -> Result<Option<ConnectionId>, EcsError> {
        let owner_peer = self.owner_peer(owner);
        self.assign_owner(entity, owner, owner_peer)
    }

    pub(crate) fn assign_owner(
        &mut self,
        entity: EntityId,
        owner: Option<ConnectionId>,
        owner_peer: Option<NetworkId>,
    ) -> Result<Option<ConnectionId>, EcsError> {
        let previous = self.entities.set_owner(entity, owner)?;
        let record = self.entities.record_mut(entity)?;
        record.owner_peer = owner_peer;
        let network_id = record.network_id;
        if let Some(network_id) = network_id {
            if let Some(recorder) = self.recording() {
                if let Some(packet) = recorder.replicate_update(ObjectKind::Entity, 0, network_id) {
                    packet.payload = json!({ "owner": owner_peer.map(|p| p.0) });
                }
            }
        }
        self.notify_owner_changed(OwnershipChanged {
            kind: ObjectKind::Entity,
            type_id: 0,
            entity,
            network_id,
            previous,
            owner,
        });
        Ok(previous)
    }

    pub(crate) fn notify_owner_changed(&mut self, event: OwnershipChanged) {
        self.ownership.pending.push_back(event);
        if !self.ownership.dispatching {
            self.dispatch_ownership();
        }
    }

    fn dispatch_ownership(&mut self) {
        self.ownership.dispatching = true;
        let mut handlers = std::mem::take(&mut self.ownership.handlers);

        while let Some(event) = self.ownership.pending.pop_front() {
            if !self.entities.is_alive(event.entity) {
                debug!(entity = %event.entity, "ownership event for a destroyed entity skipped");
                continue;
            }
            self.ownership.current = Some(event.entity);
            for handler in handlers.iter_mut() {
                handler(self, &event);
            }
            self.ownership.current = None;
            self.apply_deferred();
        }

        // Keep handlers subscribed during the broadcast, after the old ones.
        handlers.append(&mut self.ownership.handlers);
        self.ownership.handlers = handlers;
        self.ownership.dispatching = false;
    }

    fn apply_deferred(&mut self) {
        let ops = self.ownership.deferred.take();
        if ops.is_empty() {
            return;
        }
        let mut report = ApplyReport::default();
        for op in ops {
            let result = match op {
                DeferredOp::DestroyEntity(entity) => self.destroy_entity(entity),
            };
            match result {
                Ok(()) => report.success_count += 1,
                Err(e) => {
                    warn!(?op, error = %e, "deferred mutation failed");
                    report.failed_count += 1;
                }
            }
        }
        self.ownership.deferred.last_report = report;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn handlers_see_previous_and_new_owner() {
        let mut core = Core::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        core.on_ownership_changed(move |_, ev| log.borrow_mut().push((ev.previous, ev.owner)));

        let e = core.create_entity().unwrap();
        core.set_owner(e, Some(ConnectionId(2))).unwrap();
        core.set_owner(e, None).unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![(None, Some(ConnectionId(2))), (Some(ConnectionId(2)), None)]
        );
    }

    #[test]
    fn nested_set_owner_is_delivered_after_the_current_broadcast() {
        let mut core = Core::default();
        let a = core.create_entity().unwrap();
        let b = core.create_entity().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        core.on_ownership_changed(move |core, ev| {
            log.borrow_mut().push(("first", ev.entity));
            if ev.entity == a {
                core.set_owner(b, ev.owner).unwrap();
                // Applied immediately even though the event waits.
                assert_eq!(core.entity(b).unwrap().owner, ev.owner);
            }
        });
        let log = Rc::clone(&order);
        core.on_ownership_changed(move |_, ev| log.borrow_mut().push(("second", ev.entity)));

        core.set_owner(a, Some(ConnectionId(1))).unwrap();
        assert_eq!(
            *order.borrow(),
            vec![("first", a), ("second", a), ("first", b), ("second", b)]
        );
        assert!(!core.ownership().is_dispatching());
    }

    #[test]
    fn destroying_the_reported_entity_is_deferred() {
        let mut core = Core::default();
        let e = core.create_entity().unwrap();
        let later_saw_alive = Rc::new(RefCell::new(false));

        core.on_ownership_changed(|core, ev| {
            core.destroy_entity(ev.entity).unwrap();
            assert!(core.is_alive(ev.entity), "destroy must wait for the broadcast");
        });
        let flag = Rc::clone(&later_saw_alive);
        core.on_ownership_changed(move |core, ev| {
            *flag.borrow_mut() = core.is_alive(ev.entity);
        });

        core.set_owner(e, Some(ConnectionId(9))).unwrap();
        assert!(*later_saw_alive.borrow());
        assert!(!core.is_alive(e));
        assert_eq!(core.ownership().deferred().last_report().success_count, 1);
    }

    #[test]
    fn queued_events_for_destroyed_entities_are_skipped() {
        let mut core = Core::default();
        let a = core.create_entity().unwrap();
        let b = core.create_entity().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&seen);
        core.on_ownership_changed(move |core, ev| {
            log.borrow_mut().push(ev.entity);
            if ev.entity == a {
                core.set_owner(b, None).unwrap();
                core.destroy_entity(b).unwrap();
            }
        });
        core.set_owner(a, None).unwrap();
        assert_eq!(*seen.borrow(), vec![a]);
    }

    #[test]
    fn handlers_added_mid_broadcast_join_afterwards() {
        let mut core = Core::default();
        let e = core.create_entity().unwrap();
        let late_calls = Rc::new(RefCell::new(0));

        let counter = Rc::clone(&late_calls);
        let mut added = false;
        core.on_ownership_changed(move |core, _| {
            if !added {
                added = true;
                let counter = Rc::clone(&counter);
                core.on_ownership_changed(move |_, _| *counter.borrow_mut() += 1);
            }
        });

        core.set_owner(e, None).unwrap();
        assert_eq!(*late_calls.borrow(), 0);
        assert_eq!(core.ownership().handler_count(), 2);
        core.set_owner(e, None).unwrap();
        assert_eq!(*late_calls.borrow(), 1);
    }

    #[test]
    fn stale_entity_is_reported() {
        let mut core = Core::default();
        let e = core.create_entity().unwrap();
        core.destroy_entity(e).unwrap();
        assert!(matches!(
            core.set_owner(e, None),
            Err(EcsError::StaleEntity { .. })
        ));
    }
}
