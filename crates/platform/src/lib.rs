//! # skiff platform
//!
//! Shared types for the skiff SSH client core.
//!
//! This crate provides:
//! - The unified error taxonomy (`SkiffError`, `SkiffResult`)
//! - `ErrorKind`, a payload-free error category for re-raising failures
//!
//! # Examples
//!
//! ```
//! use skiff_platform::{SkiffError, SkiffResult};
//!
//! fn banner_version(line: &str) -> SkiffResult<&str> {
//!     line.strip_prefix("SSH-2.0-")
//!         .ok_or_else(|| SkiffError::ProtocolMismatch(line.to_string()))
//! }
//!
//! # fn main() -> SkiffResult<()> {
//! assert_eq!(banner_version("SSH-2.0-OpenSSH_9.6")?, "OpenSSH_9.6");
//! assert!(banner_version("SSH-1.5-old").is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{ErrorKind, SkiffError, SkiffResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
