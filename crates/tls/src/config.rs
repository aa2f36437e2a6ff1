//! Per-certificate-entry configuration
//!
//! One [`TlsContextConfig`] describes one certificate identity group served
//! by a listener: the certificate/key files (possibly several key types for
//! the same identity), cipher policy, client-auth wiring, and whether the
//! entry is the listener's default context.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Callback invoked when SNI selection finds no matching context.
///
/// Receives the requested server name. Returning `true` signals that the
/// caller may have added a matching certificate to the live set (via
/// [`TlsContextManager::add`](crate::TlsContextManager::add)) and the lookup
/// should be retried. Invoked at most once per ClientHello.
pub type SniNoMatchFn = dyn Fn(&str) -> bool + Send + Sync;

/// One certificate file plus its private key material
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    /// PEM certificate chain, leaf first
    pub cert_path: PathBuf,
    /// PEM private key. Ignored when key offload is configured.
    pub key_path: PathBuf,
    /// Optional file holding the key passphrase (PKCS#8 encrypted keys)
    pub password_path: Option<PathBuf>,
}

impl CertificateEntry {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            password_path: None,
        }
    }
}

/// Client certificate verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientVerification {
    /// Handshake fails unless the client presents a valid certificate
    #[default]
    Required,
    /// Verify a certificate if one is presented, allow anonymous clients
    Optional,
    /// Do not request client certificates
    Disabled,
}

/// Supported protocol floor/ceiling, mirroring the listener config surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

/// Parameters handed to an external async private-key offload provider
#[derive(Debug, Clone, Default)]
pub struct KeyOffloadParams {
    /// Offload backend selector; empty means no offload
    pub offload_type: String,
}

impl KeyOffloadParams {
    pub fn is_configured(&self) -> bool {
        !self.offload_type.is_empty()
    }
}

/// Configuration for one TLS server context
#[derive(Clone)]
pub struct TlsContextConfig {
    /// Certificates presenting one identity, e.g. an RSA and an ECDSA cert
    /// for the same names
    pub certificates: Vec<CertificateEntry>,
    /// Lowest protocol version offered
    pub min_version: TlsVersion,
    /// Highest protocol version offered; `None` means newest supported
    pub max_version: Option<TlsVersion>,
    /// Primary cipher suite names, preference order; empty uses the
    /// provider defaults
    pub cipher_suites: Vec<String>,
    /// Cipher suites served to clients that do not speak TLS 1.3
    pub legacy_cipher_suites: Vec<String>,
    /// Alternate legacy list; appended after `legacy_cipher_suites`
    pub legacy_alt_cipher_suites: Vec<String>,
    /// Pin key exchange to one named curve (e.g. `x25519`, `secp256r1`)
    pub ecdh_curve: Option<String>,
    /// Trust anchors for client certificate verification
    pub client_ca_file: Option<PathBuf>,
    /// Verification mode applied when `client_ca_file` is set
    pub client_verification: ClientVerification,
    /// ALPN protocols advertised, preference order
    pub alpn_protocols: Vec<String>,
    /// Keys live in this process and are loaded from `key_path`
    pub is_local_private_key: bool,
    /// Offload parameters; used when `is_local_private_key` is false
    pub key_offload_params: KeyOffloadParams,
    /// Mint and accept session tickets on this context
    pub session_ticket_enabled: bool,
    /// Serve this context when SNI is absent or unmatched
    pub is_default: bool,
    /// Hook consulted when no context matches the requested name
    pub sni_no_match: Option<Arc<SniNoMatchFn>>,
}

impl TlsContextConfig {
    /// Config for a single certificate/key pair with default policy
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            certificates: vec![CertificateEntry::new(cert_path, key_path)],
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            certificates: Vec::new(),
            min_version: TlsVersion::default(),
            max_version: None,
            cipher_suites: Vec::new(),
            legacy_cipher_suites: Vec::new(),
            legacy_alt_cipher_suites: Vec::new(),
            ecdh_curve: None,
            client_ca_file: None,
            client_verification: ClientVerification::default(),
            alpn_protocols: Vec::new(),
            is_local_private_key: true,
            key_offload_params: KeyOffloadParams::default(),
            session_ticket_enabled: true,
            is_default: false,
            sni_no_match: None,
        }
    }

    /// Whether private-key operations are delegated to an offload provider
    pub fn wants_key_offload(&self) -> bool {
        !self.is_local_private_key && self.key_offload_params.is_configured()
    }
}

impl fmt::Debug for TlsContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContextConfig")
            .field("certificates", &self.certificates)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("cipher_suites", &self.cipher_suites)
            .field("legacy_cipher_suites", &self.legacy_cipher_suites)
            .field("legacy_alt_cipher_suites", &self.legacy_alt_cipher_suites)
            .field("ecdh_curve", &self.ecdh_curve)
            .field("client_ca_file", &self.client_ca_file)
            .field("client_verification", &self.client_verification)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("is_local_private_key", &self.is_local_private_key)
            .field("key_offload_params", &self.key_offload_params)
            .field("session_ticket_enabled", &self.session_ticket_enabled)
            .field("is_default", &self.is_default)
            .field("sni_no_match", &self.sni_no_match.as_ref().map(|_| "fn"))
            .finish()
    }
}
