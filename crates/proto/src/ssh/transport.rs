//! SSH transport layer state machine (RFC 4253).
//!
//! The transport progresses through these states:
//!
//! ```text
//! Disconnected -> VersionExchange -> KeyExchange -> Established
//!                                                   |        ^
//!                                                   v        |
//!                                                   Rekeying-+
//! any state -> Closed
//! ```
//!
//! [`transition`] is a pure function of the current state and an event. It
//! returns the next state and the effects the caller must carry out, so the
//! whole lifecycle can be tested without a socket.
//!
//! # Rekeying
//!
//! [`RekeyTracker`] reports when a new key exchange is due, based on:
//! - Data transferred in both directions (1 GiB by default)
//! - Time elapsed since the last exchange (1 hour by default)
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::transport::{transition, TransportEffect, TransportEvent, TransportState};
//!
//! let (state, effects) =
//!     transition(TransportState::Disconnected, TransportEvent::Connect).unwrap();
//! assert_eq!(state, TransportState::VersionExchange);
//! assert_eq!(effects, vec![TransportEffect::SendBanner]);
//! ```

use std::fmt;
use std::time::Duration;

use skiff_platform::{ErrorKind, SkiffError, SkiffResult};
use tokio::time::Instant;

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// No stream yet.
    Disconnected,
    /// Identification strings are being exchanged.
    VersionExchange,
    /// First key exchange in progress.
    KeyExchange,
    /// Keys installed; all traffic flows.
    Established,
    /// A later key exchange is in progress; channel traffic is held.
    Rekeying,
    /// Terminal state. Nothing can be sent or received.
    Closed,
}

impl TransportState {
    /// Returns true once the first key exchange has completed and the
    /// transport has not closed.
    pub fn is_usable(self) -> bool {
        matches!(self, TransportState::Established | TransportState::Rekeying)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::VersionExchange => "version-exchange",
            TransportState::KeyExchange => "key-exchange",
            TransportState::Established => "established",
            TransportState::Rekeying => "rekeying",
            TransportState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Input to the transport state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// A byte stream is available.
    Connect,
    /// The peer's identification string was accepted.
    BannerAccepted,
    /// Both NEWKEYS messages have been exchanged.
    KexCompleted,
    /// A rekey threshold was crossed or a rekey was requested.
    RekeyDue,
    /// The peer sent KEXINIT.
    PeerKexInit,
    /// A connect or key exchange deadline expired.
    Timeout,
    /// Unrecoverable protocol, integrity or stream failure.
    Fatal,
    /// Local or peer disconnect.
    Disconnect,
}

/// Work the caller must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEffect {
    /// Write our identification string.
    SendBanner,
    /// Send our KEXINIT.
    SendKexInit,
    /// Queue outgoing messages numbered 50 and above.
    HoldChannelTraffic,
    /// Flush the queue under the new keys.
    ReleaseChannelTraffic,
    /// Shut down the byte stream.
    CloseStream,
    /// Wipe all key material.
    ZeroizeKeys,
    /// Fail every pending operation with the close reason.
    FailPending,
}

/// Computes the next state and its effects.
///
/// # Errors
///
/// Returns [`SkiffError::Protocol`] if `event` is not valid in `state`.
pub fn transition(
    state: TransportState,
    event: TransportEvent,
) -> SkiffResult<(TransportState, Vec<TransportEffect>)> {
    use TransportEffect::*;
    use TransportEvent as E;
    use TransportState as S;

    let result = match (state, event) {
        (S::Disconnected, E::Connect) => (S::VersionExchange, vec![SendBanner]),
        (S::VersionExchange, E::BannerAccepted) => {
            (S::KeyExchange, vec![SendKexInit, HoldChannelTraffic])
        }
        (S::KeyExchange, E::PeerKexInit) => (S::KeyExchange, vec![]),
        (S::KeyExchange, E::KexCompleted) => (S::Established, vec![ReleaseChannelTraffic]),
        (S::Established, E::RekeyDue) | (S::Established, E::PeerKexInit) => {
            (S::Rekeying, vec![SendKexInit, HoldChannelTraffic])
        }
        (S::Rekeying, E::RekeyDue) | (S::Rekeying, E::PeerKexInit) => (S::Rekeying, vec![]),
        (S::Rekeying, E::KexCompleted) => (S::Established, vec![ReleaseChannelTraffic]),
        (S::Closed, E::Timeout | E::Fatal | E::Disconnect) => (S::Closed, vec![]),
        (S::Disconnected, E::Timeout | E::Fatal | E::Disconnect) => (S::Closed, vec![FailPending]),
        (_, E::Timeout | E::Fatal | E::Disconnect) => {
            (S::Closed, vec![CloseStream, ZeroizeKeys, FailPending])
        }
        (state, event) => {
            return Err(SkiffError::Protocol(format!(
                "Invalid transport event {:?} in state {}",
                event, state
            )))
        }
    };

    Ok(result)
}

/// Why a transport closed.
///
/// Recorded once, when the transport first moves to Closed, and turned
/// back into an error for every operation that was pending or comes later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    kind: ErrorKind,
    message: String,
}

impl CloseReason {
    /// Records the category and text of `error`.
    pub fn from_error(error: &SkiffError) -> Self {
        let message = match error {
            SkiffError::Timeout(phase)
            | SkiffError::TransportClosed(phase)
            | SkiffError::ProtocolMismatch(phase)
            | SkiffError::MalformedPacket(phase)
            | SkiffError::KeyExchangeFailed(phase)
            | SkiffError::Protocol(phase)
            | SkiffError::Security(phase) => phase.clone(),
            other => other.to_string(),
        };
        Self {
            kind: error.kind(),
            message,
        }
    }

    /// Returns the error category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Rebuilds an error of the recorded category.
    ///
    /// Categories that carry no text of their own become
    /// [`SkiffError::TransportClosed`].
    pub fn to_error(&self) -> SkiffError {
        let message = self.message.clone();
        match self.kind {
            ErrorKind::Timeout => SkiffError::Timeout(message),
            ErrorKind::ProtocolMismatch => SkiffError::ProtocolMismatch(message),
            ErrorKind::MalformedPacket => SkiffError::MalformedPacket(message),
            ErrorKind::KeyExchangeFailed => SkiffError::KeyExchangeFailed(message),
            ErrorKind::Protocol => SkiffError::Protocol(message),
            ErrorKind::Security => SkiffError::Security(message),
            _ => SkiffError::TransportClosed(message),
        }
    }
}

/// Thresholds that trigger an automatic rekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    /// Bytes in both directions before a rekey (default: 1 GiB).
    pub max_bytes: u64,
    /// Time between rekeys (default: 1 hour).
    pub max_interval: Duration,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            max_interval: Duration::from_secs(3600),
        }
    }
}

/// Counts traffic since the last key exchange.
#[derive(Debug, Clone)]
pub struct RekeyTracker {
    policy: RekeyPolicy,
    bytes: u64,
    last_kex: Instant,
}

impl RekeyTracker {
    /// Creates a tracker starting now.
    pub fn new(policy: RekeyPolicy) -> Self {
        Self {
            policy,
            bytes: 0,
            last_kex: Instant::now(),
        }
    }

    /// Records bytes sent or received.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Returns the byte count since the last exchange.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns the instant at which the time threshold is crossed.
    pub fn deadline(&self) -> Instant {
        self.last_kex + self.policy.max_interval
    }

    /// Returns true if either threshold has been crossed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.bytes >= self.policy.max_bytes || now >= self.deadline()
    }

    /// Restarts counting after a completed exchange.
    pub fn reset(&mut self, now: Instant) {
        self.bytes = 0;
        self.last_kex = now;
    }
}

/// Per-direction packet sequence number (RFC 4253 Section 6.4).
///
/// Numbers strictly increase for the life of the transport. Running out of
/// numbers is fatal instead of wrapping, so no two packets in one direction
/// ever share a number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceCounter {
    next: u32,
    exhausted: bool,
}

impl SequenceCounter {
    /// Starts at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number for the next packet without consuming it.
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// Consumes and returns the next sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Security`] once all 2^32 numbers are used.
    pub fn advance(&mut self) -> SkiffResult<u32> {
        if self.exhausted {
            return Err(SkiffError::Security(
                "Packet sequence number exhausted".to_string(),
            ));
        }
        let current = self.next;
        match self.next.checked_add(1) {
            Some(next) => self.next = next,
            None => self.exhausted = true,
        }
        Ok(current)
    }
}
