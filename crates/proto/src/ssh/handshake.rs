//! Client side of one key exchange, reused for every rekey.
//!
//! [`KexHandshake`] consumes server key exchange messages and tells the
//! caller what to put on the wire. It never touches the socket, so the
//! whole exchange can be driven from a test with a scripted server.
//!
//! ```text
//! Idle --start()--------------> SentInit
//! Idle --server KEXINIT-------> AwaitingReply   (peer-initiated rekey)
//! SentInit --server KEXINIT---> AwaitingReply
//! AwaitingReply --REPLY-------> AwaitingNewKeys (our NEWKEYS is sent)
//! AwaitingNewKeys --NEWKEYS---> Idle            (incoming keys installed)
//! ```
//!
//! The first exchange fixes the session identifier and the server host key.
//! A later exchange presenting a different host key fails.

use std::time::Instant;

use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::crypto::{OpeningState, SealingState};
use crate::ssh::hostkey::{fingerprint, verify_signature, HostKeyCheck};
use crate::ssh::kex::{
    AlgorithmPreferences, KexDhInit, KexDhReply, KexEcdhInit, KexEcdhReply, KexInit,
    NegotiatedAlgorithms,
};
use crate::ssh::kex_dh::{Curve25519Exchange, DhGroup14Exchange, ExchangeHash, SessionKeys};
use crate::ssh::logging;

/// Something the transport must send on behalf of the handshake.
#[derive(Debug)]
pub enum KexOutput {
    /// Our KEXINIT. Channel traffic is held from here until our NEWKEYS.
    BeginKex(Vec<u8>),
    /// A key exchange message to send right away.
    Send(Vec<u8>),
    /// Send NEWKEYS, then protect every later packet with these keys.
    NewKeys(SealingState),
}

/// Result of a completed exchange.
#[derive(Debug, Clone)]
pub struct KexSummary {
    /// True for the exchange that established the session.
    pub initial: bool,
    /// Algorithms in force after this exchange
    pub algorithms: NegotiatedAlgorithms,
    /// `SHA256:` fingerprint of the server host key
    pub host_key_fingerprint: String,
    /// Time between our KEXINIT and the server's NEWKEYS
    pub duration_ms: u64,
}

enum Exchange {
    Ecdh(Curve25519Exchange),
    Dh(DhGroup14Exchange),
}

enum Phase {
    Idle,
    SentInit {
        client_kexinit: Vec<u8>,
    },
    AwaitingReply {
        exchange: Exchange,
        client_kexinit: Vec<u8>,
        server_kexinit: Vec<u8>,
        algorithms: NegotiatedAlgorithms,
    },
    AwaitingNewKeys {
        opening: OpeningState,
        summary: KexSummary,
    },
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::SentInit { .. } => "sent-init",
            Phase::AwaitingReply { .. } => "awaiting-reply",
            Phase::AwaitingNewKeys { .. } => "awaiting-newkeys",
        }
    }
}

/// Key exchange state for one connection.
pub struct KexHandshake {
    client_version: String,
    server_version: String,
    preferences: AlgorithmPreferences,
    host_key_check: HostKeyCheck,
    phase: Phase,
    session_id: Option<Vec<u8>>,
    host_key: Option<Vec<u8>>,
    skip_guessed_packet: bool,
    started: Option<Instant>,
}

impl std::fmt::Debug for KexHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexHandshake")
            .field("phase", &self.phase.name())
            .field("established", &self.session_id.is_some())
            .finish_non_exhaustive()
    }
}

impl KexHandshake {
    /// Creates the handshake once both identification strings are known.
    ///
    /// Versions are the raw lines without CR LF; they feed the exchange hash.
    pub fn new(
        client_version: impl Into<String>,
        server_version: impl Into<String>,
        preferences: AlgorithmPreferences,
        host_key_check: HostKeyCheck,
    ) -> Self {
        Self {
            client_version: client_version.into(),
            server_version: server_version.into(),
            preferences,
            host_key_check,
            phase: Phase::Idle,
            session_id: None,
            host_key: None,
            skip_guessed_packet: false,
            started: None,
        }
    }

    /// Returns true while an exchange is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Session identifier: the exchange hash of the first exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Server host key blob accepted by the first exchange.
    pub fn host_key(&self) -> Option<&[u8]> {
        self.host_key.as_deref()
    }

    /// Starts an exchange from our side.
    ///
    /// Returns our KEXINIT payload, or `None` if an exchange is already
    /// running.
    pub fn start(&mut self) -> Option<Vec<u8>> {
        if self.is_active() {
            return None;
        }

        let client_kexinit = self.preferences.kex_init().to_bytes();
        self.started = Some(Instant::now());
        self.phase = Phase::SentInit {
            client_kexinit: client_kexinit.clone(),
        };
        Some(client_kexinit)
    }

    /// Drops any exchange in progress along with its ephemeral secrets.
    pub fn abort(&mut self) {
        self.phase = Phase::Idle;
        self.skip_guessed_packet = false;
    }

    /// Handles the server's SSH_MSG_KEXINIT.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::KeyExchangeFailed`] if negotiation fails and
    /// [`SkiffError::Protocol`] if a KEXINIT arrives mid-exchange.
    pub fn handle_kexinit(&mut self, payload: &[u8]) -> SkiffResult<Vec<KexOutput>> {
        let server = KexInit::from_bytes(payload)?;
        let mut outputs = Vec::with_capacity(2);

        let client_kexinit = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::SentInit { client_kexinit } => client_kexinit,
            Phase::Idle => {
                let client_kexinit = self.preferences.kex_init().to_bytes();
                self.started = Some(Instant::now());
                outputs.push(KexOutput::BeginKex(client_kexinit.clone()));
                client_kexinit
            }
            other => {
                let phase = other.name();
                self.phase = other;
                return Err(SkiffError::Protocol(format!(
                    "Unexpected KEXINIT during key exchange ({})",
                    phase
                )));
            }
        };

        let client = KexInit::from_bytes(&client_kexinit)?;
        let algorithms = NegotiatedAlgorithms::negotiate(&client, &server)?;

        // RFC 4253 7: a wrong guess means the peer's next kex packet is discarded
        if server.first_kex_packet_follows() {
            let guessed_kex = server.kex_algorithms().first().map(String::as_str);
            let guessed_host_key = server.server_host_key_algorithms().first().map(String::as_str);
            self.skip_guessed_packet = guessed_kex != Some(algorithms.kex.name())
                || guessed_host_key != Some(algorithms.host_key.name());
        }

        logging::log_kex_negotiated(
            &self.server_version,
            algorithms.kex.name(),
            algorithms.host_key.name(),
            algorithms.cipher_client_to_server.name(),
        );

        let exchange = if algorithms.kex.is_ecdh() {
            let exchange = Curve25519Exchange::new()?;
            outputs.push(KexOutput::Send(
                KexEcdhInit {
                    public_key: exchange.public_key().to_vec(),
                }
                .to_bytes(),
            ));
            Exchange::Ecdh(exchange)
        } else {
            let exchange = DhGroup14Exchange::new();
            outputs.push(KexOutput::Send(
                KexDhInit {
                    e: exchange.public_key().to_vec(),
                }
                .to_bytes(),
            ));
            Exchange::Dh(exchange)
        };

        self.phase = Phase::AwaitingReply {
            exchange,
            client_kexinit,
            server_kexinit: payload.to_vec(),
            algorithms,
        };
        Ok(outputs)
    }

    /// Handles SSH_MSG_KEX_ECDH_REPLY or SSH_MSG_KEXDH_REPLY.
    ///
    /// Verifies the host key against policy and its signature over the
    /// exchange hash, derives new keys and returns our NEWKEYS.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::KeyExchangeFailed`] on any verification
    /// failure.
    pub fn handle_reply(&mut self, payload: &[u8]) -> SkiffResult<Vec<KexOutput>> {
        if self.skip_guessed_packet {
            self.skip_guessed_packet = false;
            return Ok(Vec::new());
        }

        let (exchange, client_kexinit, server_kexinit, algorithms) =
            match std::mem::replace(&mut self.phase, Phase::Idle) {
                Phase::AwaitingReply {
                    exchange,
                    client_kexinit,
                    server_kexinit,
                    algorithms,
                } => (exchange, client_kexinit, server_kexinit, algorithms),
                other => {
                    let phase = other.name();
                    self.phase = other;
                    return Err(SkiffError::Protocol(format!(
                        "Unexpected key exchange reply ({})",
                        phase
                    )));
                }
            };

        let (host_key, signature, shared_secret, exchange_hash) = match exchange {
            Exchange::Ecdh(exchange) => {
                let reply = KexEcdhReply::from_bytes(payload)?;
                let client_public = exchange.public_key().to_vec();
                let shared_secret = exchange.compute_shared_secret(&reply.public_key)?;
                let hash = ExchangeHash {
                    client_version: &self.client_version,
                    server_version: &self.server_version,
                    client_kexinit: &client_kexinit,
                    server_kexinit: &server_kexinit,
                    host_key: &reply.host_key,
                }
                .ecdh(&client_public, &reply.public_key, &shared_secret);
                (reply.host_key, reply.signature, shared_secret, hash)
            }
            Exchange::Dh(exchange) => {
                let reply = KexDhReply::from_bytes(payload)?;
                let shared_secret = exchange.compute_shared_secret(&reply.f)?;
                let hash = ExchangeHash {
                    client_version: &self.client_version,
                    server_version: &self.server_version,
                    client_kexinit: &client_kexinit,
                    server_kexinit: &server_kexinit,
                    host_key: &reply.host_key,
                }
                .dh(exchange.public_key(), &reply.f, &shared_secret);
                (reply.host_key, reply.signature, shared_secret, hash)
            }
        };

        if let Some(known) = &self.host_key {
            if *known != host_key {
                return Err(SkiffError::KeyExchangeFailed(
                    "Server host key changed during rekey".to_string(),
                ));
            }
        }
        self.host_key_check.check(&host_key)?;
        verify_signature(&host_key, &exchange_hash, &signature)?;

        let initial = self.session_id.is_none();
        let session_id = self.session_id.get_or_insert_with(|| exchange_hash.clone()).clone();
        self.host_key.get_or_insert_with(|| host_key.clone());

        let keys = SessionKeys::derive(&shared_secret, &exchange_hash, &session_id, &algorithms);
        let sealing = SealingState::new(
            algorithms.cipher_client_to_server,
            algorithms.mac_client_to_server,
            &keys.client_to_server,
        )?;
        let opening = OpeningState::new(
            algorithms.cipher_server_to_client,
            algorithms.mac_server_to_client,
            &keys.server_to_client,
        )?;

        self.phase = Phase::AwaitingNewKeys {
            opening,
            summary: KexSummary {
                initial,
                algorithms,
                host_key_fingerprint: fingerprint(&host_key),
                duration_ms: 0,
            },
        };
        Ok(vec![KexOutput::NewKeys(sealing)])
    }

    /// Handles the server's SSH_MSG_NEWKEYS.
    ///
    /// Returns the state for decrypting every later incoming packet.
    pub fn handle_newkeys(&mut self) -> SkiffResult<(OpeningState, KexSummary)> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitingNewKeys {
                opening,
                mut summary,
            } => {
                summary.duration_ms = self
                    .started
                    .take()
                    .map_or(0, |started| started.elapsed().as_millis() as u64);
                Ok((opening, summary))
            }
            other => {
                let phase = other.name();
                self.phase = other;
                Err(SkiffError::Protocol(format!(
                    "Unexpected NEWKEYS ({})",
                    phase
                )))
            }
        }
    }
}
