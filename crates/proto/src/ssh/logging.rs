//! Structured logging for SSH client operations
//!
//! Every event the core emits goes through these helpers so field names stay
//! consistent: `peer`, `state_from`, `state_to`, `channel`, `bytes`,
//! `method`. Key material and passwords are never passed to them.
//!
//! # Log Levels
//!
//! - **TRACE**: Individual packets and message numbers
//! - **DEBUG**: Channel window changes, held and released packets
//! - **INFO**: Transport state transitions, key exchanges, authentication
//! - **WARN**: Peer disconnects, rejected credentials, unusual messages
//! - **ERROR**: Fatal transport failures
//!
//! # Example
//!
//! ```no_run
//! use skiff_proto::ssh::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("skiff_proto::ssh=debug")
//!     .init();
//!
//! logging::log_state_transition("127.0.0.1:22", "key-exchange", "established");
//! ```

use tracing::{debug, error, info, trace, warn};

/// Log a transport state transition
pub fn log_state_transition(peer: &str, old_state: &str, new_state: &str) {
    info!(
        peer = peer,
        state_from = old_state,
        state_to = new_state,
        "Transport state transition"
    );
}

/// Log the peer's identification string
pub fn log_banner_received(peer: &str, banner: &str) {
    info!(peer = peer, banner = banner, "Server identification received");
}

/// Log the start of a key exchange
///
/// # Arguments
///
/// * `peer` - Peer address
/// * `initial` - True for the first exchange, false for a rekey
/// * `initiator` - "local" or "peer"
pub fn log_kex_start(peer: &str, initial: bool, initiator: &str) {
    info!(
        peer = peer,
        initial = initial,
        initiator = initiator,
        "Key exchange started"
    );
}

/// Log the algorithms chosen by negotiation
pub fn log_kex_negotiated(peer: &str, kex: &str, host_key: &str, cipher: &str) {
    debug!(
        peer = peer,
        kex = kex,
        host_key = host_key,
        cipher = cipher,
        "Algorithms negotiated"
    );
}

/// Log key exchange completion
///
/// # Arguments
///
/// * `peer` - Peer address
/// * `fingerprint` - Server host key fingerprint
/// * `duration_ms` - Exchange duration in milliseconds
pub fn log_kex_complete(peer: &str, fingerprint: &str, duration_ms: u64) {
    info!(
        peer = peer,
        host_key = fingerprint,
        duration_ms = duration_ms,
        "Key exchange completed"
    );
}

/// Log packets held or released around NEWKEYS
pub fn log_held_traffic(action: &str, packets: usize) {
    debug!(action = action, packets = packets, "Channel traffic during key exchange");
}

/// Log an authentication attempt
pub fn log_auth_attempt(user: &str, method: &str) {
    debug!(user = user, method = method, "Attempting authentication");
}

/// Log an authentication failure
///
/// # Arguments
///
/// * `user` - User name
/// * `method` - Method that was rejected
/// * `can_continue` - Methods the server still accepts
pub fn log_auth_rejected(user: &str, method: &str, can_continue: &[String]) {
    warn!(
        user = user,
        method = method,
        can_continue = %can_continue.join(","),
        "Authentication method rejected"
    );
}

/// Log authentication success
pub fn log_auth_success(user: &str, method: &str) {
    info!(user = user, method = method, "Authenticated");
}

/// Log a channel lifecycle event
///
/// # Arguments
///
/// * `channel` - Local channel id
/// * `event` - e.g. "open", "confirmed", "eof", "close"
pub fn log_channel_event(channel: u32, event: &str) {
    debug!(channel = channel, event = event, "Channel event");
}

/// Log a change of a channel window
pub fn log_window_adjust(channel: u32, direction: &str, bytes: u32, window: u32) {
    debug!(
        channel = channel,
        direction = direction,
        bytes = bytes,
        window = window,
        "Channel window adjusted"
    );
}

/// Log a packet leaving or entering the transport
pub fn log_packet(direction: &str, msg_type: u8, seq: u32, bytes: usize) {
    trace!(
        direction = direction,
        msg_type = msg_type,
        seq_num = seq,
        bytes = bytes,
        "Packet"
    );
}

/// Log SSH_MSG_DISCONNECT from the peer
pub fn log_peer_disconnect(peer: &str, reason_code: u32, description: &str) {
    warn!(
        peer = peer,
        reason_code = reason_code,
        description = description,
        "Peer disconnected"
    );
}

/// Log a message the client does not handle
pub fn log_unexpected_message(msg_type: u8, context: &str) {
    warn!(msg_type = msg_type, context = context, "Unexpected message");
}

/// Log a fatal transport failure
pub fn log_transport_closed(peer: &str, reason: &str) {
    error!(peer = peer, reason = reason, "Transport closed");
}
