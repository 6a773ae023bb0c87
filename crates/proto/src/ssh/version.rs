//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides open the connection by sending an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! # Security
//!
//! - Maximum line length: 255 characters
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::version::Version;
//!
//! let version = Version::new("skiff_0.1.0", Some("client"));
//! assert_eq!(version.to_string(), "SSH-2.0-skiff_0.1.0 client");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! ```

use skiff_platform::{SkiffError, SkiffResult};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Number of non-banner lines a server may send before its identification.
pub const MAX_PRE_BANNER_LINES: usize = 32;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an identification string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::version::Version;
    ///
    /// let version = Version::new("skiff_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-skiff_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the identification string this crate sends by default.
    pub fn default_client() -> Self {
        Self::new(&format!("skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH identification line.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ProtocolMismatch`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::ProtocolMismatch(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkiffError::ProtocolMismatch(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(SkiffError::ProtocolMismatch(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let mut parts = line.splitn(3, '-').skip(1);
        let (proto_version, rest) = match (parts.next(), parts.next()) {
            (Some(proto), Some(rest)) if !rest.is_empty() => (proto, rest),
            _ => {
                return Err(SkiffError::ProtocolMismatch(format!(
                    "Invalid version string format: '{}'",
                    line
                )))
            }
        };

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkiffError::ProtocolMismatch(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_9.6").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new("skiff_0.1.0", None).to_string(), "SSH-2.0-skiff_0.1.0");
        assert_eq!(
            Version::new("skiff_0.1.0", Some("test")).to_string(),
            "SSH-2.0-skiff_0.1.0 test"
        );
        assert!(Version::default_client().to_string().starts_with("SSH-2.0-skiff_"));
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13\r\n").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu13"));
    }

    #[test]
    fn test_version_parse_1_99() {
        let version = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        match Version::parse("SSH-1.5-OldServer") {
            Err(SkiffError::ProtocolMismatch(msg)) => {
                assert!(msg.contains("Unsupported protocol version"))
            }
            other => panic!("Expected ProtocolMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_version_parse_rejects_garbage() {
        for line in ["HTTP/1.1 200 OK", "SSH-2.0", "SSH-2.0-", "SSH-2.0-a\0b"] {
            assert!(
                matches!(Version::parse(line), Err(SkiffError::ProtocolMismatch(_))),
                "{:?}",
                line
            );
        }
    }

    #[test]
    fn test_version_parse_too_long() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
    }

    #[test]
    fn test_version_wire_format() {
        let version = Version::new("skiff_0.1.0", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-skiff_0.1.0\r\n");
        let parsed = Version::parse(std::str::from_utf8(&version.to_wire_format()).unwrap());
        assert_eq!(parsed.unwrap(), version);
    }
}
