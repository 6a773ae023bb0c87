//! Error types for skiff

use std::fmt;

/// Unified error type for all skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error on the underlying byte stream
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// The peer's identification banner is unusable
    ProtocolMismatch(String),

    /// A binary packet or message failed structural validation
    MalformedPacket(String),

    /// Key exchange could not complete (negotiation, signature or host key)
    KeyExchangeFailed(String),

    /// Every configured credential was rejected by the server
    AuthExhausted {
        /// Methods that were attempted, in order
        attempted: Vec<String>,
    },

    /// Operation on a channel that is closed or unknown
    ChannelClosed(u32),

    /// A connect or key-exchange deadline expired
    Timeout(String),

    /// The transport is closed
    TransportClosed(String),

    /// Unexpected message or peer protocol violation
    Protocol(String),

    /// Integrity or key material failure
    Security(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Category of a [`SkiffError`], without its payload.
///
/// Used where the same failure category must be reported more than once,
/// for example to every operation pending on a transport that closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SkiffError::Io`]
    Io,
    /// See [`SkiffError::Config`]
    Config,
    /// See [`SkiffError::ProtocolMismatch`]
    ProtocolMismatch,
    /// See [`SkiffError::MalformedPacket`]
    MalformedPacket,
    /// See [`SkiffError::KeyExchangeFailed`]
    KeyExchangeFailed,
    /// See [`SkiffError::AuthExhausted`]
    AuthExhausted,
    /// See [`SkiffError::ChannelClosed`]
    ChannelClosed,
    /// See [`SkiffError::Timeout`]
    Timeout,
    /// See [`SkiffError::TransportClosed`]
    TransportClosed,
    /// See [`SkiffError::Protocol`]
    Protocol,
    /// See [`SkiffError::Security`]
    Security,
    /// See [`SkiffError::Other`]
    Other,
}

impl SkiffError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SkiffError::Io(_) => ErrorKind::Io,
            SkiffError::Config(_) => ErrorKind::Config,
            SkiffError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            SkiffError::MalformedPacket(_) => ErrorKind::MalformedPacket,
            SkiffError::KeyExchangeFailed(_) => ErrorKind::KeyExchangeFailed,
            SkiffError::AuthExhausted { .. } => ErrorKind::AuthExhausted,
            SkiffError::ChannelClosed(_) => ErrorKind::ChannelClosed,
            SkiffError::Timeout(_) => ErrorKind::Timeout,
            SkiffError::TransportClosed(_) => ErrorKind::TransportClosed,
            SkiffError::Protocol(_) => ErrorKind::Protocol,
            SkiffError::Security(_) => ErrorKind::Security,
            SkiffError::Other(_) => ErrorKind::Other,
        }
    }

    /// Returns true if the transport cannot be used after this error.
    ///
    /// Channel and authentication failures are local; everything that
    /// leaves the byte stream in an unknown state is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SkiffError::Config(_) | SkiffError::AuthExhausted { .. } | SkiffError::ChannelClosed(_)
        )
    }
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::ProtocolMismatch(msg) => write!(f, "Protocol mismatch: {}", msg),
            SkiffError::MalformedPacket(msg) => write!(f, "Malformed packet: {}", msg),
            SkiffError::KeyExchangeFailed(msg) => write!(f, "Key exchange failed: {}", msg),
            SkiffError::AuthExhausted { attempted } => {
                if attempted.is_empty() {
                    write!(f, "Authentication exhausted: no usable credentials")
                } else {
                    write!(
                        f,
                        "Authentication exhausted after trying: {}",
                        attempted.join(", ")
                    )
                }
            }
            SkiffError::ChannelClosed(id) => write!(f, "Channel {} is closed", id),
            SkiffError::Timeout(phase) => write!(f, "Timed out during {}", phase),
            SkiffError::TransportClosed(msg) => write!(f, "Transport closed: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Security(msg) => write!(f, "Security error: {}", msg),
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
