//! Authoritative server.
//!
//! The [`ServerApp`] owns the core, the network interface, the server half
//! of the login handshake and the tick loop. Everything runs on the thread
//! that calls [`ServerApp::pump`] and [`ServerApp::tick`]; the transport may
//! do its I/O elsewhere.
//!
//! Replication only ever reaches authenticated connections. A client that
//! authenticates is sent `LoginAccepted` and then a Create packet for every
//! networked object, so it starts from the same state as everyone else.
//! Clients may update or destroy components and views of entities they own;
//! those changes are applied here and forwarded to the other clients.
//! Entity lifecycle and ownership stay with the server.

use ember_ecs::config::DisconnectPolicy;
use ember_ecs::core::Core;
use ember_ecs::entity::EntityId;
use ember_ecs::replication::{ObjectKind, ReplicationAction, ReplicationPacket};
use ember_ecs::EcsError;
use ember_net::auth::{
    AuthClient, AuthOutcome, AuthServer, Authenticate, IdentityStore, LoginAccepted,
    LoginWithAuthId, MemoryIdentityStore, PublicKeyResponse,
};
use ember_net::ids::{ConnectionId, NetworkId};
use ember_net::interface::{NetEvent, NetRole, NetworkInterface};
use ember_net::keys::KeyPair;
use ember_net::protocol::{Dispatcher, IncomingFrame};
use ember_net::transport::Transport;
use ember_net::AuthError;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::tick::TickLoop;
use crate::{engine_protocol, EngineError};

// ---------------------------------------------------------------------------
// ServerEvent
// ---------------------------------------------------------------------------

/// Connection lifecycle changes gameplay code reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The handshake succeeded and the catch-up snapshot was sent.
    ClientAuthenticated {
        connection: ConnectionId,
        user_id: String,
        network_id: NetworkId,
    },
    /// The handshake failed; the connection is being closed.
    ClientKicked {
        connection: ConnectionId,
        reason: String,
    },
    /// The connection is gone and its entities were released.
    ClientDisconnected {
        connection: ConnectionId,
        user_id: Option<String>,
        released: Vec<EntityId>,
    },
}

// ---------------------------------------------------------------------------
// Client packet policy
// ---------------------------------------------------------------------------

/// Whether `connection` may push `packet` to the server.
///
/// Clients cannot allocate network ids or change entity lifecycle or
/// ownership, and may only touch entities they own.
pub(crate) fn check_client_packet(
    core: &Core,
    connection: ConnectionId,
    packet: &ReplicationPacket,
) -> Result<(), &'static str> {
    if packet.kind == ObjectKind::Entity {
        return Err("entity lifecycle and ownership are server-side");
    }
    if packet.action == ReplicationAction::Create {
        return Err("clients cannot create networked objects");
    }
    if core.owner_of_packet(packet) != Some(connection) {
        return Err("entity is not owned by the sender");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ServerState
// ---------------------------------------------------------------------------

/// Everything packet handlers touch.
pub(crate) struct ServerState<S: IdentityStore> {
    pub(crate) core: Core,
    pub(crate) net: NetworkInterface,
    pub(crate) auth: AuthServer<S>,
    policy: DisconnectPolicy,
    /// Handshake state of the integrated local player, if any.
    pub(crate) local: Option<AuthClient>,
    events: Vec<ServerEvent>,
}

impl<S: IdentityStore> ServerState<S> {
    fn on_peer_connected(&mut self, connection: ConnectionId, network_id: Option<NetworkId>) {
        if let Some(network_id) = network_id {
            self.core.bind_peer(connection, network_id);
        }
        self.auth.on_connected(connection);
    }

    fn on_peer_disconnected(&mut self, connection: ConnectionId) {
        let user_id = self.auth.on_disconnected(connection);
        let except = self.replication_except(&[connection]);
        let policy = self.policy;

        let mut scope = self.core.replication_scope(&mut self.net, &except);
        let released = match scope.release_connection(connection, policy) {
            Ok(released) => released,
            Err(e) => {
                warn!(connection = %connection, error = %e, "could not release entities");
                Vec::new()
            }
        };
        if let Err(e) = scope.finish() {
            warn!(connection = %connection, error = %e, "could not replicate disconnect cleanup");
        }
        self.core.unbind_peer(connection);

        info!(
            connection = %connection,
            user = user_id.as_deref().unwrap_or("-"),
            released = released.len(),
            "client left"
        );
        self.events.push(ServerEvent::ClientDisconnected {
            connection,
            user_id,
            released,
        });
    }

    fn after_auth(&mut self, connection: ConnectionId, result: Result<AuthOutcome, AuthError>) {
        match result {
            Ok(AuthOutcome::Authenticated { user_id }) => self.welcome(connection, user_id),
            Ok(AuthOutcome::Kicked { reason }) => {
                self.events
                    .push(ServerEvent::ClientKicked { connection, reason });
            }
            Ok(AuthOutcome::Pending | AuthOutcome::Ignored) => {}
            Err(e) => {
                warn!(connection = %connection, error = %e, "handshake failed, closing connection");
                self.net.close_connection(connection);
            }
        }
    }

    fn welcome(&mut self, connection: ConnectionId, user_id: String) {
        let Some(network_id) = self.core.peer_network_id(connection) else {
            warn!(connection = %connection, "authenticated connection has no network id");
            self.net.close_connection(connection);
            return;
        };
        match self.send_catch_up(connection, network_id) {
            Ok(packets) => {
                debug!(connection = %connection, packets, "sent catch-up snapshot");
                self.events.push(ServerEvent::ClientAuthenticated {
                    connection,
                    user_id,
                    network_id,
                });
            }
            Err(e) => {
                warn!(connection = %connection, error = %e, "could not send catch-up, closing connection");
                self.net.close_connection(connection);
            }
        }
    }

    fn send_catch_up(
        &mut self,
        connection: ConnectionId,
        network_id: NetworkId,
    ) -> Result<usize, EngineError> {
        self.net.send(connection, &LoginAccepted { network_id })?;
        // The local player shares this core.
        if connection.is_local() {
            return Ok(0);
        }
        let packets = self.core.snapshot_packets()?;
        for packet in &packets {
            self.net.send(connection, packet)?;
        }
        Ok(packets.len())
    }

    fn on_replication(&mut self, source: ConnectionId, packet: ReplicationPacket) {
        if !self.auth.is_authenticated(source) {
            warn!(connection = %source, "replication from unauthenticated connection dropped");
            return;
        }
        if let Err(reason) = check_client_packet(&self.core, source, &packet) {
            warn!(
                connection = %source,
                kind = ?packet.kind,
                network_id = %packet.network_id,
                reason,
                "client replication rejected"
            );
            return;
        }
        if let Err(e) = self.core.apply_replication(&packet) {
            warn!(connection = %source, network_id = %packet.network_id, error = %e, "client replication failed");
            return;
        }
        let except = self.replication_except(&[source]);
        if let Err(e) = self.net.broadcast(&packet, &except) {
            warn!(connection = %source, error = %e, "could not forward client replication");
        }
    }

    /// Connections replication must skip: the unauthenticated ones plus
    /// `extra`.
    pub(crate) fn replication_except(&self, extra: &[ConnectionId]) -> Vec<ConnectionId> {
        let mut except: Vec<ConnectionId> = self
            .net
            .connections()
            .into_iter()
            .filter(|c| !self.auth.is_authenticated(*c))
            .collect();
        except.extend_from_slice(extra);
        except
    }
}

// ---------------------------------------------------------------------------
// ServerApp
// ---------------------------------------------------------------------------

/// The authoritative side of a session.
pub struct ServerApp<S: IdentityStore + 'static = MemoryIdentityStore> {
    state: ServerState<S>,
    dispatcher: Dispatcher<ServerState<S>>,
    tick_loop: TickLoop,
    config: EngineConfig,
}

impl<S: IdentityStore + 'static> ServerApp<S> {
    /// A dedicated server over a server-role transport.
    ///
    /// # Panics
    ///
    /// Panics if `config.fixed_dt` is invalid, the transport is not a server
    /// transport, or `config.auth.token_len` does not fit `keys`.
    pub fn new(config: EngineConfig, transport: Box<dyn Transport>, keys: KeyPair, store: S) -> Self {
        Self::with_role(NetRole::Server, config, transport, keys, store)
    }

    pub(crate) fn with_role(
        role: NetRole,
        config: EngineConfig,
        transport: Box<dyn Transport>,
        keys: KeyPair,
        store: S,
    ) -> Self {
        config.validate();
        let protocol = engine_protocol(config.net.wire_format);

        let mut dispatcher: Dispatcher<ServerState<S>> = Dispatcher::new(&protocol);
        dispatcher
            .on::<LoginWithAuthId, _>(|state, source, login| {
                let result = state.auth.on_login(&mut state.net, source, login);
                state.after_auth(source, result);
            })
            .on::<PublicKeyResponse, _>(|state, source, response| {
                let result = state.auth.on_public_key(&mut state.net, source, response);
                state.after_auth(source, result);
            })
            .on::<Authenticate, _>(|state, source, answer| {
                let result = state.auth.on_authenticate(&mut state.net, source, answer);
                state.after_auth(source, result);
            })
            .on::<ReplicationPacket, _>(|state, source, packet| {
                state.on_replication(source, packet);
            });

        let state = ServerState {
            core: Core::new(config.core.clone()),
            net: NetworkInterface::new(role, transport, protocol),
            auth: AuthServer::new(config.auth.clone(), keys, store),
            policy: config.disconnect_policy,
            local: None,
            events: Vec::new(),
        };
        info!(?role, fixed_dt = config.fixed_dt, "server started");
        Self {
            state,
            dispatcher,
            tick_loop: TickLoop::new(config.fixed_dt),
            config,
        }
    }

    /// Handle every network event that arrived since the last call.
    ///
    /// # Panics
    ///
    /// Panics if a replication session is open on the core.
    pub fn pump(&mut self) -> Vec<ServerEvent> {
        for event in self.state.net.poll() {
            match event {
                NetEvent::PeerConnected {
                    connection,
                    network_id,
                } => self.state.on_peer_connected(connection, network_id),
                NetEvent::PeerDisconnected { connection, .. } => {
                    self.state.on_peer_disconnected(connection)
                }
                NetEvent::Frame(frame) => self.dispatch(&frame),
            }
        }
        std::mem::take(&mut self.state.events)
    }

    fn dispatch(&mut self, frame: &IncomingFrame) {
        if let Err(e) = self.dispatcher.dispatch(&mut self.state, frame) {
            error!(connection = %frame.source, error = %e, "undecodable frame, closing connection");
            self.state.net.close_connection(frame.source);
        }
    }

    /// Run one tick and broadcast what it changed to authenticated clients.
    pub fn tick(&mut self) -> Result<usize, EngineError> {
        let except = self.state.replication_except(&[]);
        let mut scope = self
            .state
            .core
            .replication_scope(&mut self.state.net, &except);
        self.tick_loop.tick(&mut *scope);
        Ok(scope.finish()?)
    }

    /// Mutate the core and broadcast the changes to authenticated clients.
    ///
    /// Changes recorded before an error are still sent.
    pub fn replicate<R>(
        &mut self,
        f: impl FnOnce(&mut Core) -> Result<R, EcsError>,
    ) -> Result<R, EngineError> {
        let except = self.state.replication_except(&[]);
        let mut scope = self
            .state
            .core
            .replication_scope(&mut self.state.net, &except);
        let value = f(&mut *scope)?;
        scope.finish()?;
        Ok(value)
    }

    pub fn core(&self) -> &Core {
        &self.state.core
    }

    /// Direct access; changes made here are not replicated.
    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.state.core
    }

    pub fn net(&self) -> &NetworkInterface {
        &self.state.net
    }

    pub fn auth(&self) -> &AuthServer<S> {
        &self.state.auth
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

    /// Close a client's connection. Cleanup runs on the next pump.
    pub fn disconnect(&mut self, connection: ConnectionId) {
        self.state.net.close_connection(connection);
    }

    pub(crate) fn state(&self) -> &ServerState<S> {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ServerState<S> {
        &mut self.state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
