//! Error types for TLS context management
//!
//! Configuration and build failures are surfaced to the caller with enough
//! context (usually the offending file path) to act on. Handshake-time
//! misses are not errors; they are reported through the selection result.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for context build and reload operations
#[derive(Error, Debug)]
pub enum TlsManagerError {
    /// Certificate file unreadable, malformed, or expired
    #[error("error loading certificate {}: {reason}", .path.display())]
    CertLoad { path: PathBuf, reason: String },

    /// Private key missing, unreadable, undecryptable, or rejected
    #[error("error loading private key {}: {reason}", .path.display())]
    KeyLoad { path: PathBuf, reason: String },

    /// Certificates within one entry disagree on CN or SAN list
    #[error("certificate {} does not present the same identity as {}", .path.display(), .other.display())]
    IdentityMismatch { path: PathBuf, other: PathBuf },

    /// No Common Name could be extracted
    #[error("certificate {} has no usable common name", .path.display())]
    IdentityMissing { path: PathBuf },

    /// `*` in a disallowed position, or a bare `.`
    #[error("invalid wildcard name {name:?}: {reason}")]
    BadWildcard { name: String, reason: String },

    /// More than one entry marked as the default context
    #[error("more than one certificate entry is marked default")]
    DuplicateDefault,

    /// Configured ECDHE curve name does not resolve to a supported group
    #[error("unknown ECDHE curve {name:?}")]
    UnknownCurve { name: String },

    /// Cipher list rejected while building the context
    #[error("invalid cipher suite list: {detail}")]
    InvalidCipherList { detail: String },

    /// A required capability is not available in this build
    #[error("missing {feature} support: {detail}")]
    MissingFeature {
        feature: &'static str,
        detail: String,
    },
}

/// Result type alias for context build and reload operations
pub type TlsResult<T> = Result<T, TlsManagerError>;

impl TlsManagerError {
    pub(crate) fn cert_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CertLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn key_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::KeyLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
