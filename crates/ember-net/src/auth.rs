//! Challenge/response login.
//!
//! The server confirms that a client controls the private key registered for
//! a user id without that key ever leaving the client:
//!
//! 1. client → `LoginWithAuthId { user_id }`
//! 2. unknown user: server → `RequestPublicKey`, client → `PublicKeyResponse`;
//!    the key is stored and the connection is authenticated (trust on first
//!    use).
//! 3. known user: server → `Authenticate { token: E(client_key, t), server_public_key }`
//! 4. client → `Authenticate { token: E(server_key, t) }`
//! 5. the server decrypts and compares with `t`: equal authenticates, anything
//!    else kicks.
//!
//! Per-connection state only moves forward:
//! `Connected → PendingAuth → Authenticated | Kicked`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::ids::{ConnectionId, NetworkId};
use crate::interface::NetworkInterface;
use crate::keys::{KeyPair, PublicKey};
use crate::protocol::{Packet, Protocol};
use crate::stream::{PacketReader, PacketWriter};
use crate::{AuthError, NetError, ProtocolError};

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// Client → server: claim an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginWithAuthId {
    pub user_id: String,
}

impl Packet for LoginWithAuthId {
    const NAME: &'static str = "LoginWithAuthId";

    fn write(&self, writer: &mut dyn PacketWriter) {
        writer.write_str("user_id", &self.user_id);
    }

    fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            user_id: reader.read_str("user_id")?,
        })
    }
}

/// Server → client: the user id is new, send a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPublicKey;

impl Packet for RequestPublicKey {
    const NAME: &'static str = "RequestPublicKey";

    fn write(&self, _writer: &mut dyn PacketWriter) {}

    fn read(_reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
        Ok(RequestPublicKey)
    }
}

/// Client → server: DER public key for a new identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyResponse {
    pub public_key: Vec<u8>,
}

impl Packet for PublicKeyResponse {
    const NAME: &'static str = "PublicKeyResponse";

    fn write(&self, writer: &mut dyn PacketWriter) {
        writer.write_bytes("public_key", &self.public_key);
    }

    fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            public_key: reader.read_bytes("public_key")?,
        })
    }
}

/// Both directions of the challenge.
///
/// Server → client carries the token encrypted for the client plus the
/// server's public key. Client → server carries the token re-encrypted for
/// the server and an empty key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub token: Vec<u8>,
    pub server_public_key: Vec<u8>,
}

impl Packet for Authenticate {
    const NAME: &'static str = "Authenticate";

    fn write(&self, writer: &mut dyn PacketWriter) {
        writer.write_bytes("token", &self.token);
        writer.write_bytes("server_public_key", &self.server_public_key);
    }

    fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            token: reader.read_bytes("token")?,
            server_public_key: reader.read_bytes("server_public_key")?,
        })
    }
}

/// Server → client: login done; this is the network id you are known by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginAccepted {
    pub network_id: NetworkId,
}

impl Packet for LoginAccepted {
    const NAME: &'static str = "LoginAccepted";

    fn write(&self, writer: &mut dyn PacketWriter) {
        writer.write_u32("network_id", self.network_id.0);
    }

    fn read(reader: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            network_id: NetworkId(reader.read_u32("network_id")?),
        })
    }
}

/// Register the handshake packets, in a fixed order, on `protocol`.
pub fn register_auth_packets(protocol: &mut Protocol) {
    protocol.register::<LoginWithAuthId>();
    protocol.register::<RequestPublicKey>();
    protocol.register::<PublicKeyResponse>();
    protocol.register::<Authenticate>();
    protocol.register::<LoginAccepted>();
}

// ---------------------------------------------------------------------------
// AuthState
// ---------------------------------------------------------------------------

/// Server-side authentication state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    Connected,
    PendingAuth,
    Authenticated,
    Kicked,
}

impl AuthState {
    /// Whether `self → to` is an edge of the login state machine.
    pub fn can_transition(self, to: AuthState) -> bool {
        matches!(
            (self, to),
            (AuthState::Connected, AuthState::PendingAuth)
                | (AuthState::PendingAuth, AuthState::Authenticated)
                | (AuthState::PendingAuth, AuthState::Kicked)
        )
    }

    /// Move to `to`, rejecting anything that skips `PendingAuth` or goes
    /// backwards.
    pub fn transition(&mut self, to: AuthState) -> Result<(), AuthError> {
        if !self.can_transition(to) {
            return Err(AuthError::IllegalTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// AuthLink
// ---------------------------------------------------------------------------

/// A handshake message in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    Login(LoginWithAuthId),
    RequestPublicKey,
    PublicKey(PublicKeyResponse),
    Authenticate(Authenticate),
}

impl AuthMessage {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMessage::Login(_) => LoginWithAuthId::NAME,
            AuthMessage::RequestPublicKey => RequestPublicKey::NAME,
            AuthMessage::PublicKey(_) => PublicKeyResponse::NAME,
            AuthMessage::Authenticate(_) => Authenticate::NAME,
        }
    }
}

/// What the handshake needs from the network.
pub trait AuthLink {
    /// Send a handshake message. Clients address the server as
    /// [`ConnectionId::SERVER`].
    fn send_auth(&mut self, to: ConnectionId, message: AuthMessage) -> Result<(), NetError>;

    /// Drop the connection.
    fn kick(&mut self, connection: ConnectionId);
}

impl AuthLink for NetworkInterface {
    fn send_auth(&mut self, to: ConnectionId, message: AuthMessage) -> Result<(), NetError> {
        use crate::interface::PacketSink;

        match message {
            AuthMessage::Login(p) => self.send_packet(to, &p),
            AuthMessage::RequestPublicKey => self.send_packet(to, &RequestPublicKey),
            AuthMessage::PublicKey(p) => self.send_packet(to, &p),
            AuthMessage::Authenticate(p) => self.send_packet(to, &p),
        }
    }

    fn kick(&mut self, connection: ConnectionId) {
        self.close_connection(connection);
    }
}

// ---------------------------------------------------------------------------
// IdentityStore
// ---------------------------------------------------------------------------

/// Persistent user id → public key mapping.
pub trait IdentityStore {
    fn public_key(&self, user_id: &str) -> Option<PublicKey>;
    fn store(&mut self, user_id: &str, key: PublicKey);
}

/// In-memory [`IdentityStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    keys: HashMap<String, PublicKey>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn public_key(&self, user_id: &str) -> Option<PublicKey> {
        self.keys.get(user_id).cloned()
    }

    fn store(&mut self, user_id: &str, key: PublicKey) {
        self.keys.insert(user_id.to_string(), key);
    }
}

// ---------------------------------------------------------------------------
// AuthServer
// ---------------------------------------------------------------------------

/// What a handshake step did to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Still waiting for the client.
    Pending,
    /// The connection is now authenticated as `user_id`.
    Authenticated { user_id: String },
    /// The connection was kicked.
    Kicked { reason: String },
    /// The message was not applicable and changed nothing.
    Ignored,
}

#[derive(Debug)]
enum Awaiting {
    Nothing,
    PublicKey,
    Token(Vec<u8>),
}

#[derive(Debug)]
struct Session {
    state: AuthState,
    user_id: Option<String>,
    awaiting: Awaiting,
}

impl Session {
    fn new() -> Self {
        Self {
            state: AuthState::Connected,
            user_id: None,
            awaiting: Awaiting::Nothing,
        }
    }
}

/// Server half of the handshake, one session per connection.
pub struct AuthServer<S: IdentityStore> {
    config: AuthConfig,
    keys: KeyPair,
    store: S,
    sessions: BTreeMap<ConnectionId, Session>,
}

impl<S: IdentityStore> AuthServer<S> {
    /// # Panics
    ///
    /// Panics if `config.token_len` is zero or does not fit in one OAEP
    /// block of `keys`.
    pub fn new(config: AuthConfig, keys: KeyPair, store: S) -> Self {
        let max = keys.public_key().max_plaintext_len();
        assert!(
            config.token_len > 0 && config.token_len <= max,
            "token_len {} must be in 1..={max} for this key size",
            config.token_len
        );
        Self {
            config,
            keys,
            store,
            sessions: BTreeMap::new(),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keys.public_key()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start tracking a new connection.
    pub fn on_connected(&mut self, connection: ConnectionId) {
        self.sessions.insert(connection, Session::new());
    }

    /// Forget a connection, whatever state it was in. Returns the user id it
    /// claimed, if any.
    pub fn on_disconnected(&mut self, connection: ConnectionId) -> Option<String> {
        let session = self.sessions.remove(&connection)?;
        if session.state == AuthState::PendingAuth {
            debug!(connection = %connection, "released pending authentication");
        }
        session.user_id
    }

    pub fn state(&self, connection: ConnectionId) -> Option<AuthState> {
        self.sessions.get(&connection).map(|s| s.state)
    }

    pub fn user_for(&self, connection: ConnectionId) -> Option<&str> {
        self.sessions
            .get(&connection)
            .and_then(|s| s.user_id.as_deref())
    }

    pub fn is_authenticated(&self, connection: ConnectionId) -> bool {
        self.state(connection) == Some(AuthState::Authenticated)
    }

    pub fn authenticated_connections(&self) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state == AuthState::Authenticated)
            .map(|(c, _)| *c)
            .collect()
    }

    /// Step 1: a client claims `user_id`.
    pub fn on_login(
        &mut self,
        link: &mut dyn AuthLink,
        connection: ConnectionId,
        login: LoginWithAuthId,
    ) -> Result<AuthOutcome, AuthError> {
        let state = self
            .sessions
            .entry(connection)
            .or_insert_with(Session::new)
            .state;
        match state {
            AuthState::Connected => {}
            AuthState::PendingAuth => {
                return Ok(self.kick(link, connection, "repeated login while pending"));
            }
            AuthState::Authenticated | AuthState::Kicked => {
                warn!(connection = %connection, %state, "ignoring login");
                return Ok(AuthOutcome::Ignored);
            }
        }

        let duplicate = self.sessions.iter().any(|(c, s)| {
            *c != connection
                && s.user_id.as_deref() == Some(login.user_id.as_str())
                && matches!(s.state, AuthState::PendingAuth | AuthState::Authenticated)
        });

        let session = self.session_mut(connection);
        session.state.transition(AuthState::PendingAuth)?;
        if duplicate {
            return Ok(self.kick(link, connection, "user id already connected"));
        }
        session.user_id = Some(login.user_id.clone());

        match self.store.public_key(&login.user_id) {
            None => {
                self.session_mut(connection).awaiting = Awaiting::PublicKey;
                link.send_auth(connection, AuthMessage::RequestPublicKey)?;
                debug!(connection = %connection, user = %login.user_id, "new identity, requesting key");
                Ok(AuthOutcome::Pending)
            }
            Some(client_key) => {
                let challenge = match self.challenge(&client_key) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(connection = %connection, error = %e, "could not issue challenge");
                        return Ok(self.kick(link, connection, "challenge failed"));
                    }
                };
                let (token, message) = challenge;
                self.session_mut(connection).awaiting = Awaiting::Token(token);
                link.send_auth(connection, AuthMessage::Authenticate(message))?;
                Ok(AuthOutcome::Pending)
            }
        }
    }

    /// Step 2: a new identity's public key.
    pub fn on_public_key(
        &mut self,
        link: &mut dyn AuthLink,
        connection: ConnectionId,
        response: PublicKeyResponse,
    ) -> Result<AuthOutcome, AuthError> {
        if !self.expects(connection, |a| matches!(a, Awaiting::PublicKey)) {
            return Ok(self.unexpected(link, connection, PublicKeyResponse::NAME));
        }
        let key = match PublicKey::from_der(&response.public_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(connection = %connection, error = %e, "bad public key");
                return Ok(self.kick(link, connection, "invalid public key"));
            }
        };
        let user_id = self.user_for(connection).unwrap_or_default().to_string();
        info!(user = %user_id, fingerprint = %key.fingerprint(), "registered new identity");
        self.store.store(&user_id, key);
        self.authenticate(connection)
    }

    /// Step 5: the client's answer to the challenge.
    pub fn on_authenticate(
        &mut self,
        link: &mut dyn AuthLink,
        connection: ConnectionId,
        answer: Authenticate,
    ) -> Result<AuthOutcome, AuthError> {
        if !self.expects(connection, |a| matches!(a, Awaiting::Token(_))) {
            return Ok(self.unexpected(link, connection, Authenticate::NAME));
        }
        let recovered = match self.keys.decrypt(&answer.token) {
            Ok(t) => t,
            Err(_) => return Ok(self.kick(link, connection, "undecryptable token")),
        };
        let matches = matches!(
            &self.session_mut(connection).awaiting,
            Awaiting::Token(expected) if *expected == recovered
        );
        if !matches {
            return Ok(self.kick(link, connection, "token mismatch"));
        }
        self.authenticate(connection)
    }

    fn challenge(&self, client_key: &PublicKey) -> Result<(Vec<u8>, Authenticate), AuthError> {
        let mut token = vec![0u8; self.config.token_len];
        rand::thread_rng().fill_bytes(&mut token);
        let message = Authenticate {
            token: client_key.encrypt(&token)?,
            server_public_key: self.keys.public_key().to_der()?,
        };
        Ok((token, message))
    }

    fn authenticate(&mut self, connection: ConnectionId) -> Result<AuthOutcome, AuthError> {
        let session = self.session_mut(connection);
        session.state.transition(AuthState::Authenticated)?;
        session.awaiting = Awaiting::Nothing;
        let user_id = session.user_id.clone().unwrap_or_default();
        info!(connection = %connection, user = %user_id, "client authenticated");
        Ok(AuthOutcome::Authenticated { user_id })
    }

    fn expects(&self, connection: ConnectionId, awaiting: impl Fn(&Awaiting) -> bool) -> bool {
        self.sessions
            .get(&connection)
            .is_some_and(|s| s.state == AuthState::PendingAuth && awaiting(&s.awaiting))
    }

    fn unexpected(
        &mut self,
        link: &mut dyn AuthLink,
        connection: ConnectionId,
        message: &'static str,
    ) -> AuthOutcome {
        match self.state(connection) {
            Some(AuthState::PendingAuth) => self.kick(link, connection, message),
            state => {
                warn!(connection = %connection, ?state, packet = message, "unexpected handshake message");
                AuthOutcome::Ignored
            }
        }
    }

    fn kick(&mut self, link: &mut dyn AuthLink, connection: ConnectionId, reason: &str) -> AuthOutcome {
        let session = self.session_mut(connection);
        if session.state.transition(AuthState::Kicked).is_err() {
            return AuthOutcome::Ignored;
        }
        session.awaiting = Awaiting::Nothing;
        warn!(connection = %connection, reason, "kicking client");
        link.kick(connection);
        AuthOutcome::Kicked {
            reason: reason.to_string(),
        }
    }

    fn session_mut(&mut self, connection: ConnectionId) -> &mut Session {
        self.sessions.entry(connection).or_insert_with(Session::new)
    }
}

// ---------------------------------------------------------------------------
// AuthClient
// ---------------------------------------------------------------------------

/// Client-side progress through the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthState {
    Idle,
    LoginSent,
    PublicKeySent,
    ChallengeAnswered,
    Accepted { network_id: NetworkId },
}

/// Client half of the handshake.
pub struct AuthClient {
    user_id: String,
    keys: KeyPair,
    state: ClientAuthState,
}

impl AuthClient {
    pub fn new(user_id: impl Into<String>, keys: KeyPair) -> Self {
        Self {
            user_id: user_id.into(),
            keys,
            state: ClientAuthState::Idle,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> ClientAuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, ClientAuthState::Accepted { .. })
    }

    /// The network id the server assigned, once accepted.
    pub fn network_id(&self) -> Option<NetworkId> {
        match self.state {
            ClientAuthState::Accepted { network_id } => Some(network_id),
            _ => None,
        }
    }

    /// Send the login request.
    pub fn start(&mut self, link: &mut dyn AuthLink) -> Result<(), AuthError> {
        if self.state != ClientAuthState::Idle {
            return Err(AuthError::UnexpectedMessage {
                message: LoginWithAuthId::NAME,
                state: format!("{:?}", self.state),
            });
        }
        link.send_auth(
            ConnectionId::SERVER,
            AuthMessage::Login(LoginWithAuthId {
                user_id: self.user_id.clone(),
            }),
        )?;
        self.state = ClientAuthState::LoginSent;
        Ok(())
    }

    /// The server does not know us yet: hand over the public key.
    pub fn on_request_public_key(&mut self, link: &mut dyn AuthLink) -> Result<(), AuthError> {
        if self.state != ClientAuthState::LoginSent {
            warn!(state = ?self.state, "ignoring RequestPublicKey");
            return Ok(());
        }
        let public_key = self.keys.public_key().to_der()?;
        link.send_auth(
            ConnectionId::SERVER,
            AuthMessage::PublicKey(PublicKeyResponse { public_key }),
        )?;
        self.state = ClientAuthState::PublicKeySent;
        Ok(())
    }

    /// Answer the server's challenge: decrypt the token with our key and
    /// re-encrypt it for the server.
    pub fn on_authenticate(
        &mut self,
        link: &mut dyn AuthLink,
        challenge: Authenticate,
    ) -> Result<(), AuthError> {
        if self.state != ClientAuthState::LoginSent {
            warn!(state = ?self.state, "ignoring Authenticate");
            return Ok(());
        }
        let token = self.keys.decrypt(&challenge.token)?;
        let server_key = PublicKey::from_der(&challenge.server_public_key)?;
        let answer = Authenticate {
            token: server_key.encrypt(&token)?,
            server_public_key: Vec::new(),
        };
        link.send_auth(ConnectionId::SERVER, AuthMessage::Authenticate(answer))?;
        self.state = ClientAuthState::ChallengeAnswered;
        Ok(())
    }

    pub fn on_login_accepted(&mut self, accepted: LoginAccepted) {
        match self.state {
            ClientAuthState::LoginSent
            | ClientAuthState::PublicKeySent
            | ClientAuthState::ChallengeAnswered => {
                info!(user = %self.user_id, network_id = %accepted.network_id, "login accepted");
                self.state = ClientAuthState::Accepted {
                    network_id: accepted.network_id,
                };
            }
            state => warn!(?state, "ignoring LoginAccepted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
