//! Remote client.
//!
//! A [`ClientApp`] logs in as soon as the server connection is up, then
//! mirrors every replication packet the server sends. Its own changes stay
//! local unless they touch an entity the server handed to this client; those
//! are sent to the server after each tick or [`ClientApp::replicate`] call.
//!
//! The client core never hands out network ids. Components and views it adds
//! itself stay local until a create from the server names them.

use ember_ecs::config::CoreConfig;
use ember_ecs::core::Core;
use ember_ecs::replication::ReplicationPacket;
use ember_ecs::EcsError;
use ember_net::auth::{AuthClient, Authenticate, LoginAccepted, RequestPublicKey};
use ember_net::ids::{ConnectionId, NetworkId};
use ember_net::interface::{NetEvent, NetRole, NetworkInterface};
use ember_net::keys::KeyPair;
use ember_net::protocol::{Dispatcher, IncomingFrame};
use ember_net::transport::Transport;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::server::check_client_packet;
use crate::tick::TickLoop;
use crate::{engine_protocol, EngineError};

/// Session milestones seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transport reached the server and the login request went out.
    Connected,
    /// The server accepted the login.
    Accepted { network_id: NetworkId },
    /// The server connection is gone.
    Disconnected,
}

struct ClientState {
    core: Core,
    net: NetworkInterface,
    auth: AuthClient,
    events: Vec<ClientEvent>,
}

impl ClientState {
    fn on_login_accepted(&mut self, accepted: LoginAccepted) {
        let network_id = accepted.network_id;
        self.auth.on_login_accepted(accepted);
        if self.auth.network_id() == Some(network_id) {
            // Entities owned by our peer id resolve to the local connection.
            self.core.bind_peer(ConnectionId::LOCAL, network_id);
            self.events.push(ClientEvent::Accepted { network_id });
        }
    }

    fn on_replication(&mut self, source: ConnectionId, packet: ReplicationPacket) {
        if source != ConnectionId::SERVER {
            warn!(connection = %source, "replication from a non-server peer dropped");
            return;
        }
        if let Err(e) = self.core.apply_replication(&packet) {
            warn!(
                kind = ?packet.kind,
                network_id = %packet.network_id,
                action = ?packet.action,
                error = %e,
                "could not apply server replication"
            );
        }
    }

    /// Close the open session and send the server what it may accept.
    fn send_owned_changes(&mut self) -> Result<usize, EngineError> {
        let packets = self.core.discard_replication();
        let mut sent = 0;
        for packet in &packets {
            if let Err(reason) = check_client_packet(&self.core, ConnectionId::LOCAL, packet) {
                debug!(
                    kind = ?packet.kind,
                    network_id = %packet.network_id,
                    reason,
                    "change kept local"
                );
                continue;
            }
            self.net.send_to_server(packet)?;
            sent += 1;
        }
        Ok(sent)
    }
}

/// The remote side of a session.
pub struct ClientApp {
    state: ClientState,
    dispatcher: Dispatcher<ClientState>,
    tick_loop: TickLoop,
    config: EngineConfig,
}

impl ClientApp {
    /// Build a client that will log in as `user_id` with `keys`.
    ///
    /// # Panics
    ///
    /// Panics if `config.fixed_dt` is invalid or `transport` is a server
    /// transport.
    pub fn new(
        config: EngineConfig,
        transport: Box<dyn Transport>,
        user_id: impl Into<String>,
        keys: KeyPair,
    ) -> Self {
        config.validate();
        let protocol = engine_protocol(config.net.wire_format);

        let mut dispatcher: Dispatcher<ClientState> = Dispatcher::new(&protocol);
        dispatcher
            .on::<RequestPublicKey, _>(|state, _, _| {
                if let Err(e) = state.auth.on_request_public_key(&mut state.net) {
                    warn!(error = %e, "could not send public key");
                }
            })
            .on::<Authenticate, _>(|state, _, challenge| {
                if let Err(e) = state.auth.on_authenticate(&mut state.net, challenge) {
                    warn!(error = %e, "could not answer challenge");
                }
            })
            .on::<LoginAccepted, _>(|state, _, accepted| state.on_login_accepted(accepted))
            .on::<ReplicationPacket, _>(|state, source, packet| {
                state.on_replication(source, packet);
            });

        // Network ids come from the server.
        let core_config = CoreConfig {
            authoritative: false,
            ..config.core.clone()
        };
        let state = ClientState {
            core: Core::new(core_config),
            net: NetworkInterface::new(NetRole::Client, transport, protocol),
            auth: AuthClient::new(user_id, keys),
            events: Vec::new(),
        };
        Self {
            state,
            dispatcher,
            tick_loop: TickLoop::new(config.fixed_dt),
            config,
        }
    }

    /// Handle every network event that arrived since the last call.
    pub fn pump(&mut self) -> Vec<ClientEvent> {
        for event in self.state.net.poll() {
            match event {
                NetEvent::PeerConnected { .. } => {
                    info!(user = %self.state.auth.user_id(), "connected, logging in");
                    if let Err(e) = self.state.auth.start(&mut self.state.net) {
                        warn!(error = %e, "could not send login");
                    }
                    self.state.events.push(ClientEvent::Connected);
                }
                NetEvent::PeerDisconnected { .. } => {
                    info!("disconnected from server");
                    self.state.events.push(ClientEvent::Disconnected);
                }
                NetEvent::Frame(frame) => self.dispatch(&frame),
            }
        }
        std::mem::take(&mut self.state.events)
    }

    fn dispatch(&mut self, frame: &IncomingFrame) {
        if let Err(e) = self.dispatcher.dispatch(&mut self.state, frame) {
            error!(error = %e, "undecodable frame from server, disconnecting");
            self.state.net.close_connection(frame.source);
        }
    }

    /// Run one tick, then send the server the changes made to owned
    /// entities. Returns how many packets were sent.
    pub fn tick(&mut self) -> Result<usize, EngineError> {
        self.state.core.begin_replication();
        self.tick_loop.tick(&mut self.state.core);
        self.state.send_owned_changes()
    }

    /// Mutate the core, then send the server the changes made to owned
    /// entities. Everything else stays local.
    pub fn replicate<R>(
        &mut self,
        f: impl FnOnce(&mut Core) -> Result<R, EcsError>,
    ) -> Result<R, EngineError> {
        self.state.core.begin_replication();
        let result = f(&mut self.state.core);
        self.state.send_owned_changes()?;
        Ok(result?)
    }

    pub fn core(&self) -> &Core {
        &self.state.core
    }

    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.state.core
    }

    pub fn net(&self) -> &NetworkInterface {
        &self.state.net
    }

    pub fn auth(&self) -> &AuthClient {
        &self.state.auth
    }

    /// Our peer id once the server accepted the login.
    pub fn network_id(&self) -> Option<NetworkId> {
        self.state.auth.network_id()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.auth.is_authenticated()
    }

    pub fn tick_loop(&self) -> &TickLoop {
        &self.tick_loop
    }

    pub fn tick_loop_mut(&mut self) -> &mut TickLoop {
        &mut self.tick_loop
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Leave the server. `Disconnected` follows on the next pump.
    pub fn disconnect(&mut self) {
        self.state.net.close_connection(ConnectionId::SERVER);
    }
}
