//! SSH host keys and host key policy (RFC 4253 Section 6.6).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519 (RFC 8709)
//!
//! The same key type signs client public key authentication requests.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::hostkey::{verify_signature, Ed25519Keypair, HostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = Ed25519Keypair::generate();
//!
//! let signature = key.sign(b"exchange hash")?;
//! verify_signature(&key.public_key_blob(), b"exchange hash", &signature)?;
//!
//! assert!(key.fingerprint().starts_with("SHA256:"));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use sha2::{Digest, Sha256};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroizing;

use crate::ssh::wire::{read_slice, read_string, write_bytes, write_string};

const ED25519_NAME: &str = "ssh-ed25519";

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as specified in RFC 4253
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => ED25519_NAME,
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            ED25519_NAME => Some(HostKeyAlgorithm::SshEd25519),
            _ => None,
        }
    }
}

/// A private key able to produce SSH signatures.
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format
    fn public_key_blob(&self) -> Vec<u8>;

    /// Sign data and return the signature blob in SSH wire format
    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// Ed25519 key pair.
#[derive(Clone)]
pub struct Ed25519Keypair {
    signing_key: SigningKey,
}

impl Ed25519Keypair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let secret_bytes = Zeroizing::new(rand::Rng::gen::<[u8; SECRET_KEY_LENGTH]>(&mut csprng));
        Self {
            signing_key: SigningKey::from_bytes(&secret_bytes),
        }
    }

    /// Create from the 32-byte secret key
    pub fn from_bytes(secret_bytes: &[u8]) -> SkiffResult<Self> {
        let key_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> = Zeroizing::new(
            secret_bytes.try_into().map_err(|_| {
                SkiffError::Security("Ed25519 secret key must be 32 bytes".to_string())
            })?,
        );
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// Returns the raw 32-byte public key
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Returns the OpenSSH SHA256 fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_blob())
    }
}

impl HostKey for Ed25519Keypair {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, ED25519_NAME);
        write_bytes(&mut buf, self.signing_key.verifying_key().as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut buf = BytesMut::new();
        write_string(&mut buf, ED25519_NAME);
        write_bytes(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Keypair")
            .field("algorithm", &ED25519_NAME)
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Returns the OpenSSH-style fingerprint `SHA256:<base64>` of a key blob.
pub fn fingerprint(key_blob: &[u8]) -> String {
    let hash = Sha256::digest(key_blob);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
    )
}

/// Verifies an SSH signature blob against a public key blob.
///
/// # Errors
///
/// Returns [`SkiffError::KeyExchangeFailed`] if either blob is malformed,
/// the algorithms disagree or are unsupported, or the signature is invalid.
pub fn verify_signature(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> SkiffResult<()> {
    let fail = |msg: &str| SkiffError::KeyExchangeFailed(msg.to_string());

    let mut offset = 0;
    let key_algorithm =
        read_string(key_blob, &mut offset).map_err(|_| fail("Invalid host key blob"))?;
    let public_key = read_slice(key_blob, &mut offset).map_err(|_| fail("Invalid host key blob"))?;

    let mut offset = 0;
    let sig_algorithm =
        read_string(signature_blob, &mut offset).map_err(|_| fail("Invalid signature blob"))?;
    let signature =
        read_slice(signature_blob, &mut offset).map_err(|_| fail("Invalid signature blob"))?;

    if key_algorithm != sig_algorithm {
        return Err(SkiffError::KeyExchangeFailed(format!(
            "Signature algorithm {} does not match host key {}",
            sig_algorithm, key_algorithm
        )));
    }

    match HostKeyAlgorithm::from_name(&key_algorithm) {
        Some(HostKeyAlgorithm::SshEd25519) => {
            let key_bytes: [u8; 32] = public_key
                .try_into()
                .map_err(|_| fail("Ed25519 public key must be 32 bytes"))?;
            let sig_bytes: [u8; 64] = signature
                .try_into()
                .map_err(|_| fail("Ed25519 signature must be 64 bytes"))?;

            let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| {
                SkiffError::KeyExchangeFailed(format!("Invalid Ed25519 public key: {}", e))
            })?;

            verifying_key
                .verify(data, &Signature::from_bytes(&sig_bytes))
                .map_err(|_| fail("Ed25519 signature verification failed"))
        }
        None => Err(SkiffError::KeyExchangeFailed(format!(
            "Unsupported signature algorithm: {}",
            key_algorithm
        ))),
    }
}

/// Policy deciding whether a server host key is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostKeyCheck {
    /// Trust any host key whose signature verifies
    #[default]
    AcceptAny,
    /// Trust only keys with one of these `SHA256:` fingerprints
    Fingerprints(Vec<String>),
}

impl HostKeyCheck {
    /// Checks a host key blob against this policy.
    ///
    /// Fingerprints are compared with and without trailing base64 padding.
    pub fn check(&self, key_blob: &[u8]) -> SkiffResult<()> {
        match self {
            HostKeyCheck::AcceptAny => Ok(()),
            HostKeyCheck::Fingerprints(allowed) => {
                let actual = fingerprint(key_blob);
                if allowed.iter().any(|fp| fp.trim_end_matches('=') == actual) {
                    Ok(())
                } else {
                    Err(SkiffError::KeyExchangeFailed(format!(
                        "Host key {} is not trusted",
                        actual
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(HostKeyAlgorithm::SshEd25519.name(), "ssh-ed25519");
        assert_eq!(
            HostKeyAlgorithm::from_name("ssh-ed25519"),
            Some(HostKeyAlgorithm::SshEd25519)
        );
        assert!(HostKeyAlgorithm::from_name("ssh-rsa").is_none());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = Ed25519Keypair::generate();
        let signature = key.sign(b"hello").unwrap();

        assert!(verify_signature(&key.public_key_blob(), b"hello", &signature).is_ok());
        assert!(matches!(
            verify_signature(&key.public_key_blob(), b"goodbye", &signature),
            Err(SkiffError::KeyExchangeFailed(_))
        ));
    }

    #[test]
    fn test_verify_with_other_key_fails() {
        let key = Ed25519Keypair::generate();
        let other = Ed25519Keypair::generate();
        let signature = other.sign(b"data").unwrap();
        assert!(verify_signature(&key.public_key_blob(), b"data", &signature).is_err());
    }

    #[test]
    fn test_verify_rejects_garbage_blobs() {
        let key = Ed25519Keypair::generate();
        assert!(verify_signature(&[0, 0, 0], b"x", &key.sign(b"x").unwrap()).is_err());
        assert!(verify_signature(&key.public_key_blob(), b"x", &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_from_bytes_deterministic() {
        let a = Ed25519Keypair::from_bytes(&[7u8; 32]).unwrap();
        let b = Ed25519Keypair::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(a.public_key_blob(), b.public_key_blob());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(Ed25519Keypair::from_bytes(&[7u8; 31]).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"blob");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_host_key_check() {
        let key = Ed25519Keypair::generate();
        let blob = key.public_key_blob();

        assert!(HostKeyCheck::AcceptAny.check(&blob).is_ok());
        assert!(HostKeyCheck::Fingerprints(vec![key.fingerprint()]).check(&blob).is_ok());
        assert!(HostKeyCheck::Fingerprints(vec![format!("{}=", key.fingerprint())])
            .check(&blob)
            .is_ok());
        assert!(matches!(
            HostKeyCheck::Fingerprints(vec!["SHA256:nope".to_string()]).check(&blob),
            Err(SkiffError::KeyExchangeFailed(_))
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = Ed25519Keypair::from_bytes(&[0x11; 32]).unwrap();
        let debug = format!("{:?}", key);
        assert!(debug.contains("ssh-ed25519"));
        assert!(!debug.contains(&hex::encode([0x11u8; 32])));
    }
}
