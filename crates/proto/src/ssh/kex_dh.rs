//! Key agreement, exchange hash and key derivation (RFC 4253, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 (ring X25519)
//! - diffie-hellman-group14-sha256 (2048-bit MODP group, num-bigint)
//! - The exchange hash `H` (RFC 4253 Section 8, RFC 5656 Section 4)
//! - Session key derivation (RFC 4253 Section 7.2)
//!
//! All three key exchange methods hash with SHA-256.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex_dh::Curve25519Exchange;
//!
//! let client = Curve25519Exchange::new().unwrap();
//! let server = Curve25519Exchange::new().unwrap();
//!
//! let client_public = *client.public_key();
//! let server_public = *server.public_key();
//!
//! let client_secret = client.compute_shared_secret(&server_public).unwrap();
//! let server_secret = server.compute_shared_secret(&client_public).unwrap();
//! assert_eq!(*client_secret, *server_secret);
//! ```

use bytes::BytesMut;
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroizing;

use crate::ssh::crypto::{CipherAlgorithm, KeyMaterial, MacAlgorithm};
use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::wire::{encode_mpint, write_bytes, write_mpint};

/// Shared secret `K` as an unsigned big-endian integer.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// RFC 3526 group 14 prime.
const GROUP14_PRIME: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
    0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
    0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
    0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b,
    0xe3, 0x9e, 0x77, 0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2,
    0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5, 0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9,
    0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7c,
    0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff,
];

static P: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&GROUP14_PRIME));
static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// Diffie-Hellman Group 14 key exchange.
pub struct DhGroup14Exchange {
    private_key: Zeroizing<Vec<u8>>,
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();

        // 1 < x < p-1
        let p_minus_one = P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = G.modpow(&x, &P);

        Self {
            private_key: Zeroizing::new(x.to_bytes_be()),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the public value (`e` for the client, `f` for the server).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::KeyExchangeFailed`] if the peer value is
    /// outside `1 < y < p-1`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> SkiffResult<SharedSecret> {
        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = P.clone() - 1u32;

        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(SkiffError::KeyExchangeFailed(
                "Invalid peer DH public value: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(Zeroizing::new(y_peer.modpow(&x, &P).to_bytes_be()))
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Curve25519 key exchange.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> SkiffResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| SkiffError::Security("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            SkiffError::Security("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the 32-byte public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the ephemeral key.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::KeyExchangeFailed`] if the peer key has the
    /// wrong length or agreement fails.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> SkiffResult<SharedSecret> {
        if peer_public.len() != 32 {
            return Err(SkiffError::KeyExchangeFailed(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }

        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);
        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            Zeroizing::new(key_material.to_vec())
        })
        .map_err(|_| SkiffError::KeyExchangeFailed("Curve25519 key agreement failed".to_string()))
    }
}

/// Inputs shared by every exchange hash computation.
///
/// `H = HASH(V_C || V_S || I_C || I_S || K_S || <method values> || K)`
#[derive(Debug, Clone)]
pub struct ExchangeHash<'a> {
    /// Client identification string, without CR LF
    pub client_version: &'a str,
    /// Server identification string, without CR LF
    pub server_version: &'a str,
    /// Client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// Server host key blob
    pub host_key: &'a [u8],
}

impl ExchangeHash<'_> {
    fn prefix(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        write_bytes(&mut buf, self.client_version.as_bytes());
        write_bytes(&mut buf, self.server_version.as_bytes());
        write_bytes(&mut buf, self.client_kexinit);
        write_bytes(&mut buf, self.server_kexinit);
        write_bytes(&mut buf, self.host_key);
        buf
    }

    /// Hash for ECDH methods: `Q_C` and `Q_S` are strings.
    pub fn ecdh(
        &self,
        client_public: &[u8],
        server_public: &[u8],
        shared_secret: &[u8],
    ) -> Vec<u8> {
        let mut buf = self.prefix();
        write_bytes(&mut buf, client_public);
        write_bytes(&mut buf, server_public);
        write_mpint(&mut buf, shared_secret);
        Sha256::digest(&buf).to_vec()
    }

    /// Hash for finite-field DH: `e` and `f` are mpints.
    pub fn dh(&self, e: &[u8], f: &[u8], shared_secret: &[u8]) -> Vec<u8> {
        let mut buf = self.prefix();
        write_mpint(&mut buf, e);
        write_mpint(&mut buf, f);
        write_mpint(&mut buf, shared_secret);
        Sha256::digest(&buf).to_vec()
    }
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || X || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 || ...
/// ```
///
/// # Example
///
/// ```rust
/// use skiff_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let k_mpint = Zeroizing::new(encode_mpint(shared_secret));
    let mut key = Zeroizing::new(Vec::with_capacity(key_length + 32));

    let mut hasher = Sha256::new();
    hasher.update(&*k_mpint);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    key.extend_from_slice(&hasher.finalize());

    while key.len() < key_length {
        let mut hasher = Sha256::new();
        hasher.update(&*k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&*key);
        key.extend_from_slice(&hasher.finalize());
    }

    key.truncate(key_length);
    key
}

/// Key material for both directions after one key exchange.
#[derive(Debug)]
pub struct SessionKeys {
    /// Keys protecting client-to-server packets
    pub client_to_server: KeyMaterial,
    /// Keys protecting server-to-client packets
    pub server_to_client: KeyMaterial,
}

impl SessionKeys {
    /// Derives the six keys (letters A-F) sized for the negotiated
    /// algorithms.
    pub fn derive(
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        algorithms: &NegotiatedAlgorithms,
    ) -> Self {
        let direction = |cipher: CipherAlgorithm, mac: Option<MacAlgorithm>, letters: [u8; 3]| {
            let [iv, enc, integrity] = letters;
            let key = |letter: u8, len: usize| {
                derive_key(shared_secret, exchange_hash, session_id, letter, len).to_vec()
            };
            KeyMaterial {
                iv: key(iv, cipher.iv_size()),
                encryption_key: key(enc, cipher.key_size()),
                integrity_key: key(integrity, mac.map_or(0, |m| m.key_size())),
            }
        };

        Self {
            client_to_server: direction(
                algorithms.cipher_client_to_server,
                algorithms.mac_client_to_server,
                [b'A', b'C', b'E'],
            ),
            server_to_client: direction(
                algorithms.cipher_server_to_client,
                algorithms.mac_server_to_client,
                [b'B', b'D', b'F'],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::HostKeyAlgorithm;
    use crate::ssh::kex::KexAlgorithm;

    #[test]
    fn test_group14_prime() {
        assert_eq!(P.bits(), 2048);
    }

    #[test]
    fn test_dh_group14_key_exchange() {
        let client = DhGroup14Exchange::new();
        let server = DhGroup14Exchange::new();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();

        assert_eq!(*client_secret, *server_secret);
        assert!(!client_secret.is_empty());
    }

    #[test]
    fn test_dh_group14_invalid_peer_key() {
        let exchange = DhGroup14Exchange::new();
        assert!(exchange.compute_shared_secret(&[1]).is_err());
        assert!(exchange.compute_shared_secret(&GROUP14_PRIME).is_err());
    }

    #[test]
    fn test_curve25519_key_exchange() {
        let client = Curve25519Exchange::new().unwrap();
        let server = Curve25519Exchange::new().unwrap();

        let client_public = *client.public_key();
        let server_public = *server.public_key();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();

        assert_eq!(*client_secret, *server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_curve25519_rejects_short_key() {
        let client = Curve25519Exchange::new().unwrap();
        assert!(matches!(
            client.compute_shared_secret(&[1; 31]),
            Err(SkiffError::KeyExchangeFailed(_))
        ));
    }

    #[test]
    fn test_derive_key_letters_differ() {
        let key_a = derive_key(&[0x42; 32], &[1; 32], &[2; 32], b'A', 32);
        let key_c = derive_key(&[0x42; 32], &[1; 32], &[2; 32], b'C', 32);
        assert_ne!(*key_a, *key_c);
    }

    #[test]
    fn test_derive_key_extension_prefix() {
        let short = derive_key(&[0x42; 32], &[1; 32], &[2; 32], b'C', 32);
        let long = derive_key(&[0x42; 32], &[1; 32], &[2; 32], b'C', 64);
        assert_eq!(long.len(), 64);
        assert_eq!(&long[..32], &short[..]);

        let mut hasher = Sha256::new();
        hasher.update(encode_mpint(&[0x42; 32]));
        hasher.update([1u8; 32]);
        hasher.update(&short[..]);
        assert_eq!(&long[32..], &hasher.finalize()[..]);
    }

    #[test]
    fn test_exchange_hash_depends_on_every_input() {
        let base = ExchangeHash {
            client_version: "SSH-2.0-a",
            server_version: "SSH-2.0-b",
            client_kexinit: &[20, 1],
            server_kexinit: &[20, 2],
            host_key: &[9, 9],
        };
        let h = base.ecdh(&[1; 32], &[2; 32], &[3; 32]);
        assert_eq!(h.len(), 32);
        assert_ne!(h, base.ecdh(&[1; 32], &[2; 32], &[4; 32]));
        let other_server = ExchangeHash {
            server_version: "SSH-2.0-c",
            ..base.clone()
        };
        assert_ne!(h, other_server.ecdh(&[1; 32], &[2; 32], &[3; 32]));
        assert_ne!(h, base.dh(&[1; 32], &[2; 32], &[3; 32]));
    }

    #[test]
    fn test_session_keys_sized_for_algorithms() {
        let algorithms = NegotiatedAlgorithms {
            kex: KexAlgorithm::Curve25519Sha256,
            host_key: HostKeyAlgorithm::SshEd25519,
            cipher_client_to_server: CipherAlgorithm::Aes256Ctr,
            cipher_server_to_client: CipherAlgorithm::Aes128Gcm,
            mac_client_to_server: Some(MacAlgorithm::HmacSha512),
            mac_server_to_client: None,
        };
        let keys = SessionKeys::derive(&[5; 32], &[6; 32], &[7; 32], &algorithms);

        assert_eq!(keys.client_to_server.iv.len(), 16);
        assert_eq!(keys.client_to_server.encryption_key.len(), 32);
        assert_eq!(keys.client_to_server.integrity_key.len(), 64);
        assert_eq!(keys.server_to_client.iv.len(), 12);
        assert_eq!(keys.server_to_client.encryption_key.len(), 16);
        assert!(keys.server_to_client.integrity_key.is_empty());
    }
}
