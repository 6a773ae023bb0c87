//! SSH key exchange messages and algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS
//! - SSH_MSG_KEX_ECDH_INIT / SSH_MSG_KEX_ECDH_REPLY (RFC 5656, RFC 8731)
//! - SSH_MSG_KEXDH_INIT / SSH_MSG_KEXDH_REPLY (RFC 4253 Section 8)
//! - Algorithm negotiation (first client preference the server supports)
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation
//! 3. Key exchange (DH or ECDH)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the new keys
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex::{AlgorithmPreferences, KexInit, NewKeys};
//!
//! let kexinit = AlgorithmPreferences::default().kex_init();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let parsed = KexInit::from_bytes(&kexinit.to_bytes()).unwrap();
//! assert_eq!(parsed, kexinit);
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{
    expect_message, read_bool, read_bytes, read_mpint, read_name_list, read_u32, write_bytes,
    write_mpint, write_name_list,
};

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (RFC 8731)
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org (pre-standard name of the same method)
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256 (RFC 8268)
    DhGroup14Sha256,
}

impl KexAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexAlgorithm::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
        }
    }

    /// Parses a key exchange method from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" => Some(KexAlgorithm::Curve25519Sha256),
            "curve25519-sha256@libssh.org" => Some(KexAlgorithm::Curve25519Sha256Libssh),
            "diffie-hellman-group14-sha256" => Some(KexAlgorithm::DhGroup14Sha256),
            _ => None,
        }
    }

    /// Returns true for the elliptic-curve methods.
    pub fn is_ecdh(&self) -> bool {
        !matches!(self, KexAlgorithm::DhGroup14Sha256)
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Ordered algorithm preference lists offered in our KEXINIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Server host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers, used for both directions
    pub ciphers: Vec<String>,
    /// MAC algorithms, used for both directions
    pub macs: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: names(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "diffie-hellman-group14-sha256",
            ]),
            host_key: names(&["ssh-ed25519"]),
            ciphers: names(&[
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com",
                "aes256-ctr",
                "aes128-ctr",
            ]),
            macs: names(&["hmac-sha2-256", "hmac-sha2-512"]),
        }
    }
}

impl AlgorithmPreferences {
    /// Checks that every list is non-empty and names only supported
    /// algorithms.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] naming the offending entry.
    pub fn validate(&self) -> SkiffResult<()> {
        fn check(kind: &str, list: &[String], known: impl Fn(&str) -> bool) -> SkiffResult<()> {
            if list.is_empty() {
                return Err(SkiffError::Config(format!("{} list is empty", kind)));
            }
            match list.iter().find(|name| !known(name.as_str())) {
                Some(name) => Err(SkiffError::Config(format!(
                    "Unsupported {} algorithm: {}",
                    kind, name
                ))),
                None => Ok(()),
            }
        }

        check("kex", &self.kex, |n| KexAlgorithm::from_name(n).is_some())?;
        check("host key", &self.host_key, |n| {
            HostKeyAlgorithm::from_name(n).is_some()
        })?;
        check("cipher", &self.ciphers, |n| {
            CipherAlgorithm::from_name(n).is_some()
        })?;
        check("MAC", &self.macs, |n| MacAlgorithm::from_name(n).is_some())
    }

    /// Builds a KEXINIT with a fresh random cookie.
    pub fn kex_init(&self) -> KexInit {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        KexInit {
            cookie,
            kex_algorithms: self.kex.clone(),
            server_host_key_algorithms: self.host_key.clone(),
            encryption_algorithms_client_to_server: self.ciphers.clone(),
            encryption_algorithms_server_to_client: self.ciphers.clone(),
            mac_algorithms_client_to_server: self.macs.clone(),
            mac_algorithms_server_to_client: self.macs.clone(),
            compression_algorithms_client_to_server: names(&["none"]),
            compression_algorithms_server_to_client: names(&["none"]),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message to bytes (without packet framing).
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        for list in [
            &self.kex_algorithms,
            &self.server_host_key_algorithms,
            &self.encryption_algorithms_client_to_server,
            &self.encryption_algorithms_server_to_client,
            &self.mac_algorithms_client_to_server,
            &self.mac_algorithms_server_to_client,
            &self.compression_algorithms_client_to_server,
            &self.compression_algorithms_server_to_client,
            &self.languages_client_to_server,
            &self.languages_server_to_client,
        ] {
            write_name_list(&mut buf, list);
        }

        buf.put_u8(u8::from(self.first_kex_packet_follows));
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for a wrong message type and
    /// [`SkiffError::MalformedPacket`] for a truncated message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::KexInit as u8, "SSH_MSG_KEXINIT")?;

        let cookie: [u8; 16] = data
            .get(1..17)
            .and_then(|c| c.try_into().ok())
            .ok_or_else(|| {
                SkiffError::MalformedPacket(format!(
                    "KEXINIT message too short: {} bytes (minimum 17)",
                    data.len()
                ))
            })?;

        let mut offset = 17;
        let kex_algorithms = read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = read_name_list(data, &mut offset)?;
        let encryption_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let encryption_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let mac_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let mac_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let compression_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let compression_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let languages_client_to_server = read_name_list(data, &mut offset)?;
        let languages_server_to_client = read_name_list(data, &mut offset)?;
        let first_kex_packet_follows = read_bool(data, &mut offset)?;
        let _reserved = read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// After it is sent, every packet in that direction uses the new keys.
/// Sequence numbers are not reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::NewKeys as u8, "SSH_MSG_NEWKEYS")?;
        Ok(Self)
    }
}

/// SSH_MSG_KEX_ECDH_INIT (30): the client's ephemeral public key `Q_C`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhInit {
    /// Client ephemeral public key
    pub public_key: Vec<u8>,
}

impl KexEcdhInit {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhInit as u8);
        write_bytes(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::KexdhInit as u8, "SSH_MSG_KEX_ECDH_INIT")?;
        let mut offset = 1;
        Ok(Self {
            public_key: read_bytes(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY (31): host key `K_S`, server key `Q_S` and the
/// signature over the exchange hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhReply {
    /// Server host key blob
    pub host_key: Vec<u8>,
    /// Server ephemeral public key
    pub public_key: Vec<u8>,
    /// Signature blob over H
    pub signature: Vec<u8>,
}

impl KexEcdhReply {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhReply as u8);
        write_bytes(&mut buf, &self.host_key);
        write_bytes(&mut buf, &self.public_key);
        write_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::KexdhReply as u8, "SSH_MSG_KEX_ECDH_REPLY")?;
        let mut offset = 1;
        Ok(Self {
            host_key: read_bytes(data, &mut offset)?,
            public_key: read_bytes(data, &mut offset)?,
            signature: read_bytes(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_KEXDH_INIT (30): the client's DH value `e`.
///
/// Shares its message number with [`KexEcdhInit`]; the value is an mpint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhInit {
    /// Unsigned big-endian `e`
    pub e: Vec<u8>,
}

impl KexDhInit {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhInit as u8);
        write_mpint(&mut buf, &self.e);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::KexdhInit as u8, "SSH_MSG_KEXDH_INIT")?;
        let mut offset = 1;
        Ok(Self {
            e: read_mpint(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_KEXDH_REPLY (31): host key, DH value `f` and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexDhReply {
    /// Server host key blob
    pub host_key: Vec<u8>,
    /// Unsigned big-endian `f`
    pub f: Vec<u8>,
    /// Signature blob over H
    pub signature: Vec<u8>,
}

impl KexDhReply {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhReply as u8);
        write_bytes(&mut buf, &self.host_key);
        write_mpint(&mut buf, &self.f);
        write_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::KexdhReply as u8, "SSH_MSG_KEXDH_REPLY")?;
        let mut offset = 1;
        Ok(Self {
            host_key: read_bytes(data, &mut offset)?,
            f: read_mpint(data, &mut offset)?,
            signature: read_bytes(data, &mut offset)?,
        })
    }
}

/// Negotiates one algorithm: the first client entry the server also lists.
///
/// # Errors
///
/// Returns [`SkiffError::KeyExchangeFailed`] if no common algorithm exists.
///
/// # Example
///
/// ```rust
/// use skiff_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes256-ctr");
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> SkiffResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            SkiffError::KeyExchangeFailed(format!(
                "No common algorithm: client={:?}, server={:?}",
                client_list, server_list
            ))
        })
}

/// Algorithms agreed for one key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: KexAlgorithm,
    /// Host key algorithm
    pub host_key: HostKeyAlgorithm,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server (None for AEAD ciphers)
    pub mac_client_to_server: Option<MacAlgorithm>,
    /// MAC server to client (None for AEAD ciphers)
    pub mac_server_to_client: Option<MacAlgorithm>,
}

impl NegotiatedAlgorithms {
    /// Negotiates every algorithm from both KEXINIT messages.
    ///
    /// MACs are only negotiated for directions whose cipher is not AEAD.
    pub fn negotiate(client: &KexInit, server: &KexInit) -> SkiffResult<Self> {
        let unsupported = |kind: &str, name: &str| {
            SkiffError::KeyExchangeFailed(format!("Unsupported {}: {}", kind, name))
        };

        let kex_name = negotiate_algorithm(&client.kex_algorithms, &server.kex_algorithms)?;
        let kex = KexAlgorithm::from_name(&kex_name).ok_or_else(|| unsupported("kex", &kex_name))?;

        let host_key_name = negotiate_algorithm(
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?;
        let host_key = HostKeyAlgorithm::from_name(&host_key_name)
            .ok_or_else(|| unsupported("host key", &host_key_name))?;

        let cipher = |c: &[String], s: &[String]| -> SkiffResult<CipherAlgorithm> {
            let name = negotiate_algorithm(c, s)?;
            CipherAlgorithm::from_name(&name).ok_or_else(|| unsupported("cipher", &name))
        };
        let cipher_client_to_server = cipher(
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
        )?;
        let cipher_server_to_client = cipher(
            &client.encryption_algorithms_server_to_client,
            &server.encryption_algorithms_server_to_client,
        )?;

        let mac = |cipher: CipherAlgorithm,
                   c: &[String],
                   s: &[String]|
         -> SkiffResult<Option<MacAlgorithm>> {
            if cipher.is_aead() {
                return Ok(None);
            }
            let name = negotiate_algorithm(c, s)?;
            MacAlgorithm::from_name(&name)
                .map(Some)
                .ok_or_else(|| unsupported("MAC", &name))
        };
        let mac_client_to_server = mac(
            cipher_client_to_server,
            &client.mac_algorithms_client_to_server,
            &server.mac_algorithms_client_to_server,
        )?;
        let mac_server_to_client = mac(
            cipher_server_to_client,
            &client.mac_algorithms_server_to_client,
            &server.mac_algorithms_server_to_client,
        )?;

        negotiate_algorithm(
            &client.compression_algorithms_client_to_server,
            &server.compression_algorithms_client_to_server,
        )?;
        negotiate_algorithm(
            &client.compression_algorithms_server_to_client,
            &server.compression_algorithms_server_to_client,
        )?;

        Ok(Self {
            kex,
            host_key,
            cipher_client_to_server,
            cipher_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
        })
    }
}
