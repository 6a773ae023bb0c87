//! SSH message numbers and transport-level generic messages (RFC 4253).
//!
//! # Message Ranges
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication** (50-79): Authentication protocol
//! - **Connection Protocol** (80-127): Global requests and channels
//!
//! While a key exchange is in progress only messages in
//! [`MessageClass::Transport`] and [`MessageClass::KeyExchange`] may be sent
//! (RFC 4253 Section 7.1); everything else is held back until NEWKEYS.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::message::{MessageClass, MessageType};
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(MessageClass::of(94), MessageClass::Connection);
//! assert!(MessageClass::of(31).allowed_during_kex());
//! ```

use crate::ssh::wire::{expect_message, read_bool, read_string, read_u32, write_string};
use bytes::{BufMut, BytesMut};
use skiff_platform::SkiffResult;

/// SSH message types as defined in RFC 4250 Section 4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Terminates the connection.
    Disconnect = 1,
    /// Ignored by the receiver; used for keep-alive.
    Ignore = 2,
    /// Reply to a message number the receiver does not know.
    Unimplemented = 3,
    /// Debugging information.
    Debug = 4,
    /// Service request (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service request accepted.
    ServiceAccept = 6,
    /// Algorithm negotiation.
    KexInit = 20,
    /// Switch to the newly negotiated keys.
    NewKeys = 21,
    /// DH or ECDH exchange init (same number for both methods).
    KexdhInit = 30,
    /// DH or ECDH exchange reply (same number for both methods).
    KexdhReply = 31,
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Server accepts the offered public key.
    UserauthPkOk = 60,
    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel request success.
    ChannelSuccess = 99,
    /// Channel request failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        let ty = match byte {
            1 => MessageType::Disconnect,
            2 => MessageType::Ignore,
            3 => MessageType::Unimplemented,
            4 => MessageType::Debug,
            5 => MessageType::ServiceRequest,
            6 => MessageType::ServiceAccept,
            20 => MessageType::KexInit,
            21 => MessageType::NewKeys,
            30 => MessageType::KexdhInit,
            31 => MessageType::KexdhReply,
            50 => MessageType::UserauthRequest,
            51 => MessageType::UserauthFailure,
            52 => MessageType::UserauthSuccess,
            53 => MessageType::UserauthBanner,
            60 => MessageType::UserauthPkOk,
            80 => MessageType::GlobalRequest,
            81 => MessageType::RequestSuccess,
            82 => MessageType::RequestFailure,
            90 => MessageType::ChannelOpen,
            91 => MessageType::ChannelOpenConfirmation,
            92 => MessageType::ChannelOpenFailure,
            93 => MessageType::ChannelWindowAdjust,
            94 => MessageType::ChannelData,
            95 => MessageType::ChannelExtendedData,
            96 => MessageType::ChannelEof,
            97 => MessageType::ChannelClose,
            98 => MessageType::ChannelRequest,
            99 => MessageType::ChannelSuccess,
            100 => MessageType::ChannelFailure,
            _ => return None,
        };
        Some(ty)
    }

    /// Returns the RFC name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEX_ECDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Protocol layer a message number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// 1-19, excluding service request/accept.
    Transport,
    /// 5-6, service request and accept.
    Service,
    /// 20-49.
    KeyExchange,
    /// 50-79.
    Authentication,
    /// 80-255.
    Connection,
}

impl MessageClass {
    /// Classifies a message number.
    pub fn of(byte: u8) -> Self {
        match byte {
            5 | 6 => MessageClass::Service,
            0..=19 => MessageClass::Transport,
            20..=49 => MessageClass::KeyExchange,
            50..=79 => MessageClass::Authentication,
            _ => MessageClass::Connection,
        }
    }

    /// Returns true if a message of this class may be sent between our
    /// KEXINIT and our NEWKEYS.
    pub fn allowed_during_kex(self) -> bool {
        matches!(self, MessageClass::Transport | MessageClass::KeyExchange)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect.
    HostNotAllowedToConnect = 1,
    /// Protocol error.
    ProtocolError = 2,
    /// Key exchange failed.
    KeyExchangeFailed = 3,
    /// MAC error.
    MacError = 5,
    /// Service not available.
    ServiceNotAvailable = 7,
    /// Protocol version not supported.
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable.
    HostKeyNotVerifiable = 9,
    /// Connection lost.
    ConnectionLost = 10,
    /// Disconnected by application.
    ByApplication = 11,
    /// No more authentication methods available.
    NoMoreAuthMethodsAvailable = 14,
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Numeric reason code as received.
    pub reason_code: u32,
    /// Human-readable description.
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: &str) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::Disconnect as u8, "DISCONNECT")?;
        let mut offset = 1;
        let reason_code = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset)?;
        Ok(Self {
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_DEBUG (RFC 4253 Section 11.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the sender asked for the message to be displayed.
    pub always_display: bool,
    /// Message text.
    pub message: String,
}

impl DebugMessage {
    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::Debug as u8, "DEBUG")?;
        let mut offset = 1;
        let always_display = read_bool(data, &mut offset)?;
        let message = read_string(data, &mut offset)?;
        Ok(Self {
            always_display,
            message,
        })
    }
}

/// Builds SSH_MSG_IGNORE carrying `data`.
pub fn ignore_message(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(MessageType::Ignore as u8);
    crate::ssh::wire::write_bytes(&mut buf, data);
    buf.to_vec()
}

/// Builds SSH_MSG_UNIMPLEMENTED for the rejected packet's sequence number.
pub fn unimplemented_message(sequence: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.to_vec()
}
