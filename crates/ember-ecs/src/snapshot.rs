//! Canonical snapshot of networked state and its hash.
//!
//! Two cores that agree on every networked entity, its owner, its component
//! values and its views produce the same [`Core::state_hash`], whatever their
//! local entity ids, slot layout or history. Local-only entities,
//! components and views are left out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::Core;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One networked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub network_id: u32,
    /// Peer network id of the owner.
    pub owner: Option<u32>,
    /// Component name to JSON value. `BTreeMap` keeps serialization ordered.
    pub components: BTreeMap<String, serde_json::Value>,
    /// Attached view type names, sorted.
    pub views: Vec<String>,
}

/// Every networked entity, sorted by network id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSnapshot {
    pub entities: Vec<EntitySnapshot>,
}

impl Core {
    pub fn capture_snapshot(&self) -> Result<CoreSnapshot, EcsError> {
        let mut entities = Vec::new();
        for record in self.entities() {
            let Some(network_id) = record.network_id else {
                continue;
            };
            let mut components = BTreeMap::new();
            for (type_id, component) in &record.components {
                if self.storage().network_id(*component).is_none() {
                    continue;
                }
                let name = self
                    .registry()
                    .get_info(*type_id)
                    .map_or_else(|| format!("#{}", type_id.0), |i| i.name.clone());
                components.insert(name, self.storage().serialize(*component)?);
            }
            let mut views: Vec<String> = record
                .views
                .iter()
                .filter(|v| self.views().network_id(**v).is_some())
                .filter_map(|v| self.views().info(v.type_id).map(|i| i.name.clone()))
                .collect();
            views.sort();
            entities.push(EntitySnapshot {
                network_id: network_id.0,
                owner: record.owner_peer.map(|p| p.0),
                components,
                views,
            });
        }
        entities.sort_by_key(|e| e.network_id);
        Ok(CoreSnapshot { entities })
    }

    /// BLAKE3 hex digest of the canonical JSON snapshot.
    pub fn state_hash(&self) -> Result<String, EcsError> {
        let snapshot = self.capture_snapshot()?;
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| {
            EcsError::ComponentSerializationError {
                component: "snapshot".to_owned(),
                details: e.to_string(),
            }
        })?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}
