//! A server with a local player.
//!
//! The local player lives on [`ConnectionId::LOCAL`] and shares the server's
//! core, so it never receives replication. It still goes through the login
//! handshake over the in-process loopback, which gives it a peer network id
//! and lets it own entities like any remote client.

use std::ops::{Deref, DerefMut};

use ember_ecs::core::Core;
use ember_ecs::entity::EntityId;
use ember_ecs::EcsError;
use ember_net::auth::{
    AuthClient, Authenticate, IdentityStore, LoginAccepted, MemoryIdentityStore, RequestPublicKey,
};
use ember_net::ids::{ConnectionId, NetworkId};
use ember_net::interface::NetRole;
use ember_net::keys::KeyPair;
use ember_net::protocol::Dispatcher;
use ember_net::transport::Transport;
use tracing::{error, warn};

use crate::config::EngineConfig;
use crate::server::{ServerApp, ServerEvent, ServerState};
use crate::{engine_protocol, EngineError};

/// Server plus local player.
///
/// Dereferences to the underlying [`ServerApp`].
pub struct IntegratedApp<S: IdentityStore + 'static = MemoryIdentityStore> {
    app: ServerApp<S>,
    local_dispatcher: Dispatcher<ServerState<S>>,
}

impl<S: IdentityStore + 'static> IntegratedApp<S> {
    /// Start the server and send the local player's login.
    ///
    /// # Panics
    ///
    /// Panics on the same conditions as [`ServerApp::new`].
    pub fn new(
        config: EngineConfig,
        transport: Box<dyn Transport>,
        server_keys: KeyPair,
        store: S,
        local_user: impl Into<String>,
        local_keys: KeyPair,
    ) -> Result<Self, EngineError> {
        let protocol = engine_protocol(config.net.wire_format);
        let mut app = ServerApp::with_role(NetRole::Integrated, config, transport, server_keys, store);

        let mut local_dispatcher: Dispatcher<ServerState<S>> = Dispatcher::new(&protocol);
        local_dispatcher
            .on::<RequestPublicKey, _>(|state, _, _| {
                let Some(local) = state.local.as_mut() else { return };
                if let Err(e) = local.on_request_public_key(&mut state.net) {
                    warn!(error = %e, "local player could not send public key");
                }
            })
            .on::<Authenticate, _>(|state, _, challenge| {
                let Some(local) = state.local.as_mut() else { return };
                if let Err(e) = local.on_authenticate(&mut state.net, challenge) {
                    warn!(error = %e, "local player could not answer challenge");
                }
            })
            .on::<LoginAccepted, _>(|state, _, accepted| {
                if let Some(local) = state.local.as_mut() {
                    local.on_login_accepted(accepted);
                }
            });

        let state = app.state_mut();
        let mut local = AuthClient::new(local_user, local_keys);
        local.start(&mut state.net)?;
        state.local = Some(local);

        Ok(Self {
            app,
            local_dispatcher,
        })
    }

    /// Handle network events, letting the server and the local player trade
    /// messages until neither has anything left to say.
    ///
    /// # Panics
    ///
    /// Panics if a replication session is open on the core.
    pub fn pump(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            events.extend(self.app.pump());
            let frames = self.app.state_mut().net.take_local_frames();
            if frames.is_empty() {
                return events;
            }
            for frame in &frames {
                if let Err(e) = self.local_dispatcher.dispatch(self.app.state_mut(), frame) {
                    error!(error = %e, "local player could not decode a server frame");
                }
            }
        }
    }

    /// The local player's handshake state.
    pub fn local_auth(&self) -> Option<&AuthClient> {
        self.app.state().local.as_ref()
    }

    /// The local player's peer id, once its login was accepted.
    pub fn local_network_id(&self) -> Option<NetworkId> {
        self.local_auth().and_then(AuthClient::network_id)
    }

    pub fn is_local_authenticated(&self) -> bool {
        self.app.auth().is_authenticated(ConnectionId::LOCAL)
    }

    /// Spawn a networked entity owned by the local player.
    pub fn spawn_local_entity(&mut self) -> Result<EntityId, EngineError> {
        self.app.replicate(|core: &mut Core| {
            let entity = core.create_networked_entity()?;
            core.set_owner(entity, Some(ConnectionId::LOCAL))?;
            Ok::<_, EcsError>(entity)
        })
    }

    pub fn app(&self) -> &ServerApp<S> {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut ServerApp<S> {
        &mut self.app
    }
}

impl<S: IdentityStore + 'static> Deref for IntegratedApp<S> {
    type Target = ServerApp<S>;

    fn deref(&self) -> &ServerApp<S> {
        &self.app
    }
}

impl<S: IdentityStore + 'static> DerefMut for IntegratedApp<S> {
    fn deref_mut(&mut self) -> &mut ServerApp<S> {
        &mut self.app
    }
}
