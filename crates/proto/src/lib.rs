//! SSH2 client core for the skiff project.
//!
//! This crate provides the protocol layers of an SSH client:
//!
//! - Binary packet codec with AES-GCM, AES-CTR and HMAC-SHA2
//! - Transport state machine with Curve25519 and DH group 14 key exchange,
//!   Ed25519 host keys and automatic rekeying
//! - Public key and password authentication
//! - Channel multiplexing with per-channel flow control
//!
//! # Features
//!
//! - `ssh` (default) - SSH client support
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::PacketCodec;
//!
//! // Frame an SSH payload and decode it back
//! let codec = PacketCodec::plain();
//! let packet = codec.frame(b"SSH message payload".to_vec()).unwrap();
//! let wire_format = codec.encode(&packet);
//!
//! let (parsed, _) = codec.decode(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - Constant-time MAC verification
//! - Secure memory handling with `zeroize`
//! - Property tests and a fuzz target for the packet decoder

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
