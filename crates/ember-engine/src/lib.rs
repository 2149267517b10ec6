//! Ember Engine -- server, client and integrated apps over the Ember core.
//!
//! This crate wires [`ember_ecs`] and [`ember_net`] together: a
//! [`ServerApp`](server::ServerApp) authenticates clients, sends late joiners
//! a catch-up snapshot, accepts client changes only for entities they own and
//! cleans up after departed connections; a [`ClientApp`](client::ClientApp)
//! logs in and mirrors the server's state; an
//! [`IntegratedApp`](integrated::IntegratedApp) is a server whose local
//! player shares its core. All of them drive a view-based
//! [`TickLoop`](tick::TickLoop).
//!
//! # Quick Start
//!
//! ```
//! use ember_engine::prelude::*;
//!
//! let config = EngineConfig { fixed_dt: 1.0 / 30.0, ..Default::default() };
//! let mut tick_loop = TickLoop::new(config.fixed_dt);
//! let mut core = Core::new(config.core.clone());
//!
//! tick_loop.run_ticks(&mut core, 30);
//! assert_eq!(tick_loop.tick_count(), 30);
//! assert!((tick_loop.sim_time() - 1.0).abs() < 1e-9);
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod integrated;
pub mod server;
pub mod tick;

use ember_ecs::replication::ReplicationPacket;
use ember_net::auth::register_auth_packets;
use ember_net::protocol::Protocol;
use ember_net::stream::WireFormat;

/// Re-export the ECS crate for convenience.
pub use ember_ecs;

/// Re-export the networking crate for convenience.
pub use ember_net;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by the apps.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ecs(#[from] ember_ecs::EcsError),

    #[error(transparent)]
    Net(#[from] ember_net::NetError),

    #[error(transparent)]
    Auth(#[from] ember_net::AuthError),

    #[error(transparent)]
    Protocol(#[from] ember_net::ProtocolError),
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// The packet registry every Ember peer uses: the handshake messages, then
/// replication. Ids follow registration order, so both ends build it here.
pub fn engine_protocol(format: WireFormat) -> Protocol {
    let mut protocol = Protocol::new(format);
    register_auth_packets(&mut protocol);
    protocol.register::<ReplicationPacket>();
    protocol
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use ember_ecs::prelude::*;
    pub use ember_net::prelude::*;

    pub use crate::client::{ClientApp, ClientEvent};
    pub use crate::config::EngineConfig;
    pub use crate::engine_protocol;
    pub use crate::integrated::IntegratedApp;
    pub use crate::server::{ServerApp, ServerEvent};
    pub use crate::tick::{SystemFn, SystemStats, TickDiagnostics, TickLoop};
    pub use crate::EngineError;
}
