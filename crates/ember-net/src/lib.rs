//! Ember Net -- packet protocol, transports and client authentication.
//!
//! This crate carries everything that crosses a machine boundary: the
//! self-describing packet format ([`protocol`], [`stream`]), the delivery
//! flags ([`flags`]), the transport seam plus an in-process implementation
//! ([`transport`]), the I/O service thread ([`service`]), the game-thread
//! facing [`NetworkInterface`](interface::NetworkInterface), and the
//! challenge/response login handshake ([`auth`], [`keys`]).
//!
//! # Quick Start
//!
//! ```
//! use ember_net::prelude::*;
//!
//! struct Hello { name: String }
//!
//! impl Packet for Hello {
//!     const NAME: &'static str = "Hello";
//!     fn write(&self, w: &mut dyn PacketWriter) { w.write_str("name", &self.name); }
//!     fn read(r: &mut dyn PacketReader) -> Result<Self, ProtocolError> {
//!         Ok(Hello { name: r.read_str("name")? })
//!     }
//! }
//!
//! let protocol = Protocol::new(WireFormat::Binary).with::<Hello>();
//! let frame = protocol.encode(&Hello { name: "ada".into() }).unwrap();
//! let back: Hello = protocol.decode(&frame).unwrap();
//! assert_eq!(back.name, "ada");
//! ```

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod flags;
pub mod ids;
pub mod interface;
pub mod keys;
pub mod protocol;
pub mod service;
pub mod stream;
pub mod transport;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A binary frame ended before a field could be read.
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    /// A text frame lacks a named field.
    #[error("missing field '{name}'")]
    MissingField { name: String },

    /// A text frame holds a field of the wrong JSON type.
    #[error("field '{name}' is not a {expected}")]
    FieldType { name: String, expected: &'static str },

    /// A field decoded but holds a value outside its domain.
    #[error("field '{name}' has an invalid value: {details}")]
    InvalidValue { name: String, details: String },

    /// A string field is not UTF-8.
    #[error("field '{name}' is not valid UTF-8")]
    InvalidUtf8 { name: String },

    /// Unknown flag bits or `RELIABLE | NO_DELAY`.
    #[error("invalid packet flags {bits:#010b}")]
    InvalidFlags { bits: u8 },

    /// The frame's type id is not registered in this process.
    #[error("unknown packet type id {type_id}")]
    UnknownPacketType { type_id: u16 },

    /// The frame could not be parsed at all.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Errors produced by the network interface and transports.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The operation is not valid for this interface's role.
    #[error("'{operation}' is not available on a {role:?} interface")]
    WrongRole {
        operation: &'static str,
        role: interface::NetRole,
    },

    /// No live connection with this id.
    #[error("unknown connection {0}")]
    UnknownConnection(ids::ConnectionId),

    /// The peer went away while sending.
    #[error("connection {0} is closed")]
    ConnectionClosed(ids::ConnectionId),

    /// The I/O service thread is no longer running.
    #[error("network service thread has stopped")]
    ServiceStopped,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by identity keys and the login handshake.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// A state change that would skip `PendingAuth` or go backwards.
    #[error("illegal auth transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: auth::AuthState,
        to: auth::AuthState,
    },

    /// Encryption, decryption or key generation failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A key blob could not be parsed or encoded.
    #[error("invalid key data: {0}")]
    InvalidKey(String),

    /// The handshake message arrived when it was not expected.
    #[error("unexpected handshake message '{message}' in state {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: String,
    },

    #[error(transparent)]
    Net(#[from] NetError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::auth::{
        register_auth_packets, AuthClient, AuthLink, AuthMessage, AuthOutcome, AuthServer,
        AuthState, Authenticate, ClientAuthState, IdentityStore, LoginAccepted,
        LoginWithAuthId, MemoryIdentityStore, PublicKeyResponse, RequestPublicKey,
    };
    pub use crate::config::{AuthConfig, NetConfig};
    pub use crate::flags::PacketFlags;
    pub use crate::ids::{ConnectionId, NetworkId, NetworkIdAllocator};
    pub use crate::interface::{NetEvent, NetRole, NetworkInterface, PacketSink, PeerDirectory};
    pub use crate::keys::{KeyPair, PublicKey};
    pub use crate::protocol::{
        DispatchOutcome, Dispatcher, FrameHeader, IncomingFrame, Packet, PacketTypeId, Protocol,
    };
    pub use crate::service::{ServiceHandle, ServiceThread};
    pub use crate::stream::{PacketReader, PacketWriter, WireFormat};
    pub use crate::transport::{
        MemoryClientTransport, MemoryHub, MemoryServerTransport, Transport, TransportEvent,
        TransportRole,
    };
    pub use crate::{AuthError, NetError, ProtocolError};
}
