//! SSH cipher and MAC state for one direction of the transport.
//!
//! Supported algorithms:
//! - AES-128-GCM, AES-256-GCM (`@openssh.com`, RFC 5647 packet layout)
//! - AES-128-CTR, AES-256-CTR with encrypt-and-MAC
//! - HMAC-SHA256, HMAC-SHA512
//!
//! # Security
//!
//! - **AEAD nonces** - 4-byte fixed IV plus an 8-byte invocation counter that
//!   advances once per packet
//! - **MAC** - computed over `sequence || plaintext packet`, compared in
//!   constant time
//! - **Key material** - zeroized on drop, never printed by `Debug`
//!
//! [`SealingState`] and [`OpeningState`] wrap a [`PacketCodec`] so the
//! stream reader and writer only deal with payloads and wire bytes.

use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM, NONCE_LEN,
};
use sha2::{Sha256, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::ssh::packet::{PacketCodec, LENGTH_FIELD_LEN};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// AEAD nonce: fixed 4-byte IV prefix plus 64-bit invocation counter.
struct InvocationCounter {
    fixed: [u8; 4],
    counter: u64,
}

impl InvocationCounter {
    fn new(iv: &[u8]) -> SkiffResult<Self> {
        let iv: [u8; NONCE_LEN] = iv
            .get(..NONCE_LEN)
            .and_then(|iv| iv.try_into().ok())
            .ok_or_else(|| SkiffError::Security("AEAD IV must be 12 bytes".to_string()))?;
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..]);
        Ok(Self {
            fixed,
            counter: u64::from_be_bytes(counter),
        })
    }
}

impl NonceSequence for InvocationCounter {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        Ok(Nonce::assume_unique_for_key(nonce))
    }
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// No encryption (before the first NEWKEYS)
    None,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Parses a negotiable cipher name. `none` is never negotiated.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => NONCE_LEN,
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 16,
        }
    }

    /// Returns the cipher block size used for packet alignment.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::None => 8,
            _ => 16,
        }
    }

    /// Returns the authentication tag size in bytes (for AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    /// Returns true if this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(self, CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm)
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }
}

/// Derived keys for one direction of the transport.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Initial IV
    pub iv: Vec<u8>,
    /// Encryption key
    pub encryption_key: Vec<u8>,
    /// Integrity key (empty for AEAD ciphers)
    pub integrity_key: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("iv", &"<redacted>")
            .field("encryption_key", &"<redacted>")
            .field("integrity_key", &"<redacted>")
            .finish()
    }
}

/// HMAC key bound to an algorithm.
struct MacKey {
    algorithm: MacAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl MacKey {
    fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkiffResult<Self> {
        let key = key_material.get(..algorithm.key_size()).ok_or_else(|| {
            SkiffError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            ))
        })?;
        Ok(Self {
            algorithm,
            key: Zeroizing::new(key.to_vec()),
        })
    }

    fn compute(&self, sequence: u32, packet: &[u8]) -> SkiffResult<Vec<u8>> {
        let invalid = |_| SkiffError::Security("Invalid HMAC key length".to_string());
        let mac = match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).map_err(invalid)?;
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key).map_err(invalid)?;
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(mac)
    }

    fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> SkiffResult<()> {
        let computed = self.compute(sequence, packet)?;
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(SkiffError::Security("MAC verification failed".to_string()))
        }
    }
}

enum CtrCipher {
    Aes128(Box<Aes128Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl CtrCipher {
    fn new(algorithm: CipherAlgorithm, keys: &KeyMaterial) -> SkiffResult<Self> {
        let invalid = |_| SkiffError::Security("Invalid AES-CTR key or IV length".to_string());
        let key = &keys.encryption_key;
        let iv = &keys.iv;
        match algorithm {
            CipherAlgorithm::Aes128Ctr => Ok(CtrCipher::Aes128(Box::new(
                Aes128Ctr::new_from_slices(key, iv).map_err(invalid)?,
            ))),
            CipherAlgorithm::Aes256Ctr => Ok(CtrCipher::Aes256(Box::new(
                Aes256Ctr::new_from_slices(key, iv).map_err(invalid)?,
            ))),
            other => Err(SkiffError::Security(format!(
                "{} is not a CTR cipher",
                other.name()
            ))),
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CtrCipher::Aes128(c) => c.apply_keystream(data),
            CtrCipher::Aes256(c) => c.apply_keystream(data),
        }
    }
}

fn gcm_key(algorithm: CipherAlgorithm, keys: &KeyMaterial) -> SkiffResult<UnboundKey> {
    let aead = match algorithm {
        CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
        CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
        other => {
            return Err(SkiffError::Security(format!(
                "{} is not an AEAD cipher",
                other.name()
            )))
        }
    };
    let key = keys
        .encryption_key
        .get(..algorithm.key_size())
        .ok_or_else(|| {
            SkiffError::Security(format!(
                "Insufficient key material: expected {}, got {}",
                algorithm.key_size(),
                keys.encryption_key.len()
            ))
        })?;
    UnboundKey::new(aead, key)
        .map_err(|_| SkiffError::Security(format!("Failed to create {} key", algorithm.name())))
}

fn require_mac(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> SkiffResult<MacAlgorithm> {
    mac.ok_or_else(|| {
        SkiffError::KeyExchangeFailed(format!("{} requires a MAC algorithm", cipher.name()))
    })
}

enum Sealer {
    None,
    Gcm(Box<SealingKey<InvocationCounter>>),
    Ctr(CtrCipher, MacKey),
}

/// Outgoing packet protection: frames, MACs and encrypts payloads.
pub struct SealingState {
    algorithm: CipherAlgorithm,
    codec: PacketCodec,
    sealer: Sealer,
}

impl std::fmt::Debug for SealingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingState")
            .field("algorithm", &self.algorithm)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl SealingState {
    /// State used before the first NEWKEYS.
    pub fn plain() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            codec: PacketCodec::plain(),
            sealer: Sealer::None,
        }
    }

    /// Creates sealing state from negotiated algorithms and derived keys.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Security`] on short key material, or
    /// [`SkiffError::KeyExchangeFailed`] if a CTR cipher has no MAC.
    pub fn new(
        algorithm: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        keys: &KeyMaterial,
    ) -> SkiffResult<Self> {
        let (codec, sealer) = match algorithm {
            CipherAlgorithm::None => (PacketCodec::plain(), Sealer::None),
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                let key =
                    SealingKey::new(gcm_key(algorithm, keys)?, InvocationCounter::new(&keys.iv)?);
                (
                    PacketCodec::aead(algorithm.block_size()),
                    Sealer::Gcm(Box::new(key)),
                )
            }
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                let mac = require_mac(algorithm, mac)?;
                (
                    PacketCodec::new(algorithm.block_size(), mac.mac_size()),
                    Sealer::Ctr(
                        CtrCipher::new(algorithm, keys)?,
                        MacKey::new(mac, &keys.integrity_key)?,
                    ),
                )
            }
        };

        Ok(Self {
            algorithm,
            codec,
            sealer,
        })
    }

    /// Returns the cipher in use.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Returns the framing parameters in use.
    pub fn codec(&self) -> PacketCodec {
        self.codec
    }

    /// Turns a payload into protected wire bytes.
    pub fn seal(&mut self, payload: Vec<u8>, sequence: u32) -> SkiffResult<Vec<u8>> {
        let packet = self.codec.frame(payload)?;
        let mut wire = self.codec.encode(&packet);

        match &mut self.sealer {
            Sealer::None => {}
            Sealer::Ctr(cipher, mac_key) => {
                let mac = mac_key.compute(sequence, &wire)?;
                cipher.apply(&mut wire);
                wire.extend_from_slice(&mac);
            }
            Sealer::Gcm(key) => {
                let mut length = [0u8; LENGTH_FIELD_LEN];
                length.copy_from_slice(&wire[..LENGTH_FIELD_LEN]);
                let mut body = wire.split_off(LENGTH_FIELD_LEN);
                key.seal_in_place_append_tag(Aad::from(length), &mut body)
                    .map_err(|_| SkiffError::Security("Encryption failed".to_string()))?;
                wire.extend_from_slice(&body);
            }
        }

        Ok(wire)
    }
}

enum Opener {
    None,
    Gcm(Box<OpeningKey<InvocationCounter>>),
    Ctr(CtrCipher, MacKey),
}

/// Incoming packet protection: decrypts, verifies and unframes packets.
///
/// Reading a packet is split in two so the stream reader knows how many
/// bytes to wait for: [`begin`](Self::begin) on the first
/// [`first_block_len`](Self::first_block_len) bytes returns the remainder,
/// [`finish`](Self::finish) on the whole packet returns the payload.
pub struct OpeningState {
    algorithm: CipherAlgorithm,
    codec: PacketCodec,
    opener: Opener,
}

impl std::fmt::Debug for OpeningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningState")
            .field("algorithm", &self.algorithm)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl OpeningState {
    /// State used before the first NEWKEYS.
    pub fn plain() -> Self {
        Self {
            algorithm: CipherAlgorithm::None,
            codec: PacketCodec::plain(),
            opener: Opener::None,
        }
    }

    /// Creates opening state from negotiated algorithms and derived keys.
    pub fn new(
        algorithm: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        keys: &KeyMaterial,
    ) -> SkiffResult<Self> {
        let (codec, opener) = match algorithm {
            CipherAlgorithm::None => (PacketCodec::plain(), Opener::None),
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                let key =
                    OpeningKey::new(gcm_key(algorithm, keys)?, InvocationCounter::new(&keys.iv)?);
                (
                    PacketCodec::aead(algorithm.block_size()),
                    Opener::Gcm(Box::new(key)),
                )
            }
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                let mac = require_mac(algorithm, mac)?;
                (
                    PacketCodec::new(algorithm.block_size(), mac.mac_size()),
                    Opener::Ctr(
                        CtrCipher::new(algorithm, keys)?,
                        MacKey::new(mac, &keys.integrity_key)?,
                    ),
                )
            }
        };

        Ok(Self {
            algorithm,
            codec,
            opener,
        })
    }

    /// Returns the cipher in use.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Number of bytes needed before the packet length is known.
    pub fn first_block_len(&self) -> usize {
        match self.opener {
            Opener::Ctr(..) => self.codec.block_size(),
            _ => LENGTH_FIELD_LEN,
        }
    }

    /// Decrypts the first block in place if needed and returns how many
    /// more bytes make up the packet (including MAC or tag).
    pub fn begin(&mut self, first_block: &mut [u8]) -> SkiffResult<usize> {
        if let Opener::Ctr(cipher, _) = &mut self.opener {
            cipher.apply(first_block);
        }

        let packet_length = self.codec.peek_length(first_block)?;
        let total =
            LENGTH_FIELD_LEN + packet_length + self.codec.mac_len() + self.algorithm.tag_size();

        total.checked_sub(first_block.len()).ok_or_else(|| {
            SkiffError::MalformedPacket(format!(
                "Packet length {} shorter than first block",
                packet_length
            ))
        })
    }

    /// Verifies and decrypts a whole packet whose first block went through
    /// [`begin`](Self::begin), returning its payload.
    pub fn finish(&mut self, mut packet: Vec<u8>, sequence: u32) -> SkiffResult<Vec<u8>> {
        match &mut self.opener {
            Opener::None => {}
            Opener::Ctr(cipher, mac_key) => {
                let first = self.codec.block_size();
                let mac_start = packet
                    .len()
                    .checked_sub(self.codec.mac_len())
                    .filter(|&start| start >= first)
                    .ok_or_else(|| SkiffError::MalformedPacket("Packet too short".to_string()))?;
                cipher.apply(&mut packet[first..mac_start]);
                mac_key.verify(sequence, &packet[..mac_start], &packet[mac_start..])?;
            }
            Opener::Gcm(key) => {
                let mut length = [0u8; LENGTH_FIELD_LEN];
                length.copy_from_slice(packet.get(..LENGTH_FIELD_LEN).ok_or_else(|| {
                    SkiffError::MalformedPacket("Packet too short".to_string())
                })?);
                let mut body = packet.split_off(LENGTH_FIELD_LEN);
                let plaintext_len = key
                    .open_in_place(Aad::from(length), &mut body)
                    .map_err(|_| {
                        SkiffError::Security(
                            "Decryption failed or authentication tag mismatch".to_string(),
                        )
                    })?
                    .len();
                body.truncate(plaintext_len);
                packet.extend_from_slice(&body);
            }
        }

        let (decoded, _) = self.codec.decode(&packet)?;
        Ok(decoded.into_payload())
    }
}
