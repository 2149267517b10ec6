//! Core sizing and disconnect policy.

use serde::{Deserialize, Serialize};

/// Limits applied when a [`Core`](crate::core::Core) is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Upper bound on simultaneously alive entities.
    pub max_entities: usize,
    /// Pool capacity for components registered without an explicit one.
    pub default_pool_capacity: usize,
    /// Whether this core hands out network ids. A client core does not: the
    /// objects it creates stay local until the server's create names them.
    pub authoritative: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_entities: 4096,
            default_pool_capacity: 1024,
            authoritative: true,
        }
    }
}

impl CoreConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// What happens to a connection's entities when it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Destroy every entity the connection owned.
    #[default]
    Destroy,
    /// Keep the entities but clear their owner.
    Orphan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = CoreConfig::from_json_str(r#"{"max_entities": 8}"#).unwrap();
        assert_eq!(cfg.max_entities, 8);
        assert_eq!(cfg.default_pool_capacity, 1024);
        assert!(cfg.authoritative);
        assert_eq!(DisconnectPolicy::default(), DisconnectPolicy::Destroy);
        let policy: DisconnectPolicy = serde_json::from_str(r#""orphan""#).unwrap();
        assert_eq!(policy, DisconnectPolicy::Orphan);
    }
}
