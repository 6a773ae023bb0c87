//! SSH connection protocol messages (RFC 4254).
//!
//! This module implements the channel messages a client sends and receives:
//! - Channel open, confirmation and failure
//! - Data, extended data, window adjust
//! - EOF and close
//! - Channel requests: exec, shell, subsystem, env, pty-req, exit-status,
//!   exit-signal
//!
//! Global requests from the server are answered by the dispatcher and have
//! no codec here beyond [`GlobalRequest`].
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen {
//!     channel_type: ChannelType::Session,
//!     sender_channel: 0,
//!     initial_window_size: 2 * 1024 * 1024,
//!     maximum_packet_size: 32 * 1024,
//! };
//! assert_eq!(ChannelOpen::from_bytes(&open.to_bytes()).unwrap(), open);
//! ```

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::message::MessageType;
use crate::ssh::wire::{
    expect_message, read_bool, read_bytes, read_string, read_u32, write_bool, write_bytes,
    write_string,
};

/// Channel type requested in CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (exec, shell, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other type, carried by name only.
    Other(String),
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and its type-specific data
    pub channel_type: ChannelType,
    /// Sender channel number
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        write_string(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        if let ChannelType::DirectTcpip {
            host,
            port,
            originator_address,
            originator_port,
        } = &self.channel_type
        {
            write_string(&mut buf, host);
            buf.put_u32(*port);
            write_string(&mut buf, originator_address);
            buf.put_u32(*originator_port);
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::ChannelOpen as u8, "CHANNEL_OPEN")?;
        let mut offset = 1;

        let type_name = read_string(data, &mut offset)?;
        let sender_channel = read_u32(data, &mut offset)?;
        let initial_window_size = read_u32(data, &mut offset)?;
        let maximum_packet_size = read_u32(data, &mut offset)?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: read_string(data, &mut offset)?,
                port: read_u32(data, &mut offset)?,
                originator_address: read_string(data, &mut offset)?,
                originator_port: read_u32(data, &mut offset)?,
            },
            _ => ChannelType::Other(type_name),
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel number
    pub recipient_channel: u32,
    /// Peer's channel number
    pub sender_channel: u32,
    /// Peer's initial window
    pub initial_window_size: u32,
    /// Largest data packet the peer accepts
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(
            data,
            MessageType::ChannelOpenConfirmation as u8,
            "CHANNEL_OPEN_CONFIRMATION",
        )?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            sender_channel: read_u32(data, &mut offset)?,
            initial_window_size: read_u32(data, &mut offset)?,
            maximum_packet_size: read_u32(data, &mut offset)?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Our channel number
    pub recipient_channel: u32,
    /// Reason code as received
    pub reason_code: u32,
    /// Human-readable description
    pub description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with an empty description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::ChannelOpenFailure as u8, "CHANNEL_OPEN_FAILURE")?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            reason_code: read_u32(data, &mut offset)?,
            description: read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Bytes added to the window
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::ChannelWindowAdjust as u8, "CHANNEL_WINDOW_ADJUST")?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            bytes_to_add: read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data bytes
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_data(self.recipient_channel, &self.data)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::ChannelData as u8, "CHANNEL_DATA")?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

/// Builds CHANNEL_DATA without copying the data into a message struct first.
pub fn encode_data(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(9 + data.len());
    buf.put_u8(MessageType::ChannelData as u8);
    buf.put_u32(recipient_channel);
    write_bytes(&mut buf, data);
    buf.to_vec()
}

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data type code (1 = stderr)
    pub data_type_code: u32,
    /// Data bytes
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(
            data,
            MessageType::ChannelExtendedData as u8,
            "CHANNEL_EXTENDED_DATA",
        )?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data_type_code: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

fn encode_channel_only(msg: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(msg as u8);
    buf.put_u32(recipient_channel);
    buf.to_vec()
}

fn decode_channel_only(data: &[u8], msg: MessageType, name: &str) -> SkiffResult<u32> {
    expect_message(data, msg as u8, name)?;
    let mut offset = 1;
    read_u32(data, &mut offset)
}

/// SSH_MSG_CHANNEL_EOF (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    /// Recipient channel number
    pub recipient_channel: u32,
}

impl ChannelEof {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_channel_only(MessageType::ChannelEof, self.recipient_channel)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let recipient_channel = decode_channel_only(data, MessageType::ChannelEof, "CHANNEL_EOF")?;
        Ok(Self { recipient_channel })
    }
}

/// SSH_MSG_CHANNEL_CLOSE (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    /// Recipient channel number
    pub recipient_channel: u32,
}

impl ChannelClose {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_channel_only(MessageType::ChannelClose, self.recipient_channel)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let recipient_channel =
            decode_channel_only(data, MessageType::ChannelClose, "CHANNEL_CLOSE")?;
        Ok(Self { recipient_channel })
    }
}

/// SSH_MSG_CHANNEL_SUCCESS (RFC 4254 Section 5.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSuccess {
    /// Recipient channel number
    pub recipient_channel: u32,
}

impl ChannelSuccess {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_channel_only(MessageType::ChannelSuccess, self.recipient_channel)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let recipient_channel =
            decode_channel_only(data, MessageType::ChannelSuccess, "CHANNEL_SUCCESS")?;
        Ok(Self { recipient_channel })
    }
}

/// SSH_MSG_CHANNEL_FAILURE (RFC 4254 Section 5.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFailure {
    /// Recipient channel number
    pub recipient_channel: u32,
}

impl ChannelFailure {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_channel_only(MessageType::ChannelFailure, self.recipient_channel)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let recipient_channel =
            decode_channel_only(data, MessageType::ChannelFailure, "CHANNEL_FAILURE")?;
        Ok(Self { recipient_channel })
    }
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start the user's shell
    Shell,
    /// Start a subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Exit status of the remote command
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Remote command terminated by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// Unrecognised request; type-specific data is not kept.
    Other(String),
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Request type and its data
    pub request_type: ChannelRequestType,
    /// Whether the sender expects SUCCESS or FAILURE
    pub want_reply: bool,
}

impl ChannelRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        write_string(&mut buf, self.request_type.name());
        write_bool(&mut buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                write_string(&mut buf, term);
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                write_bytes(&mut buf, modes);
            }
            ChannelRequestType::Env { name, value } => {
                write_string(&mut buf, name);
                write_string(&mut buf, value);
            }
            ChannelRequestType::Exec { command } => write_string(&mut buf, command),
            ChannelRequestType::Subsystem { name } => write_string(&mut buf, name),
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                write_string(&mut buf, signal_name);
                write_bool(&mut buf, *core_dumped);
                write_string(&mut buf, error_message);
                write_string(&mut buf, "");
            }
            ChannelRequestType::Shell | ChannelRequestType::Other(_) => {}
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::ChannelRequest as u8, "CHANNEL_REQUEST")?;
        let mut offset = 1;

        let recipient_channel = read_u32(data, &mut offset)?;
        let name = read_string(data, &mut offset)?;
        let want_reply = read_bool(data, &mut offset)?;

        let request_type = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: read_string(data, &mut offset)?,
                width_chars: read_u32(data, &mut offset)?,
                height_rows: read_u32(data, &mut offset)?,
                width_pixels: read_u32(data, &mut offset)?,
                height_pixels: read_u32(data, &mut offset)?,
                modes: read_bytes(data, &mut offset)?,
            },
            "env" => ChannelRequestType::Env {
                name: read_string(data, &mut offset)?,
                value: read_string(data, &mut offset)?,
            },
            "exec" => ChannelRequestType::Exec {
                command: read_string(data, &mut offset)?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: read_string(data, &mut offset)?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: read_u32(data, &mut offset)?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: read_string(data, &mut offset)?,
                core_dumped: read_bool(data, &mut offset)?,
                error_message: read_string(data, &mut offset)?,
            },
            _ => ChannelRequestType::Other(name),
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST header (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether the sender expects a reply
    pub want_reply: bool,
}

impl GlobalRequest {
    /// Parses the request name and reply flag; request data is ignored.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::GlobalRequest as u8, "GLOBAL_REQUEST")?;
        let mut offset = 1;
        Ok(Self {
            name: read_string(data, &mut offset)?,
            want_reply: read_bool(data, &mut offset)?,
        })
    }
}

/// Builds SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

/// Reads the recipient channel of any channel message (numbers 91-100).
pub fn recipient_channel(data: &[u8]) -> SkiffResult<u32> {
    match data.first() {
        Some(91..=100) => {
            let mut offset = 1;
            read_u32(data, &mut offset)
        }
        Some(other) => Err(SkiffError::Protocol(format!(
            "Message {} is not addressed to a channel",
            other
        ))),
        None => Err(SkiffError::MalformedPacket("Empty message".to_string())),
    }
}
