//! SSH2 client core.
//!
//! This module implements the client side of the SSH protocol according to
//! RFC 4251-4254.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire codec** ([`wire`], [`packet`], [`crypto`]) - Binary packet
//!    protocol with encryption and integrity (RFC 4253 Section 6)
//! 2. **Transport** ([`version`], [`kex`], [`handshake`], [`transport`],
//!    [`packet_io`]) - Identification, key exchange, rekeying and the
//!    transport state machine (RFC 4253)
//! 3. **Authentication** ([`auth`]) - User authentication (RFC 4252)
//! 4. **Channels** ([`connection`], [`channel`], [`mux`]) - Channel
//!    multiplexing with flow control (RFC 4254)
//! 5. **Session** ([`session`]) - Composes the layers into one client
//!    session
//!
//! Two background tasks run per session: a writer that owns the write half
//! of the stream and a dispatcher that owns the read half. Sends from any
//! task are serialized through the writer's queue, so concurrent channel
//! writes never interleave on the wire.
//!
//! # Security Considerations
//!
//! - **Input Validation**: Packet lengths are checked before any allocation
//!   (max 35000 bytes)
//! - **Integrity**: MACs and AEAD tags are verified in constant time
//! - **Memory Safety**: Keys and passwords are zeroized on drop using
//!   [`zeroize`]
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod channel;
pub mod connection;
pub mod crypto;
pub mod handshake;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod logging;
pub mod message;
pub mod mux;
pub mod packet;
pub mod packet_io;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

mod connection_mgr;
mod dispatcher;

// Re-export main types
pub use auth::{AuthOutcome, AuthPolicy, AuthState, Credential, Credentials};
pub use channel::{ChannelDefaults, ChannelId, ChannelState, Window};
pub use connection::{ChannelRequestType, ChannelType};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use handshake::KexSummary;
pub use hostkey::{fingerprint, Ed25519Keypair, HostKey, HostKeyAlgorithm, HostKeyCheck};
pub use kex::{AlgorithmPreferences, KexAlgorithm};
pub use message::{DisconnectReason, MessageType};
pub use mux::{Channel, ChannelMux};
pub use packet::{Packet, PacketCodec};
pub use session::{Session, SessionConfig};
pub use transport::{RekeyPolicy, TransportState};
pub use version::Version;
