//! Engine-wide settings, loadable from one JSON document.

use ember_ecs::config::{CoreConfig, DisconnectPolicy};
use ember_net::config::{AuthConfig, NetConfig};
use serde::{Deserialize, Serialize};

/// Settings for a server, client or integrated app.
///
/// ```
/// use ember_engine::config::EngineConfig;
///
/// let config = EngineConfig::from_json_str(r#"{ "fixed_dt": 0.05, "disconnect_policy": "orphan" }"#).unwrap();
/// assert_eq!(config.fixed_dt, 0.05);
/// assert_eq!(config.core.max_entities, 4096);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    pub core: CoreConfig,
    pub net: NetConfig,
    pub auth: AuthConfig,
    /// What happens to a client's entities when it disconnects.
    pub disconnect_policy: DisconnectPolicy,
}

impl Default for EngineConfig {
    /// 60 Hz, default core, network and auth settings, `Destroy` on
    /// disconnect.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            core: CoreConfig::default(),
            net: NetConfig::default(),
            auth: AuthConfig::default(),
            disconnect_policy: DisconnectPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// # Panics
    ///
    /// Panics if `fixed_dt` is not positive and finite.
    pub fn validate(&self) {
        assert!(
            self.fixed_dt > 0.0 && self.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            self.fixed_dt
        );
    }
}
