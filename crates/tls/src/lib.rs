//! Zentinel TLS Context Management
//!
//! Per-listener TLS context management with SNI-based certificate
//! selection. One [`TlsContextManager`] serves one listening VIP:PORT and
//! owns a set of pre-configured rustls server contexts, one per certificate
//! identity group:
//!
//! - **SNI selection**: exact hostname match, then one-label wildcard
//!   match, with a crypto-strength axis so SHA-1 certificates are served
//!   only to clients that cannot handle better
//! - **Atomic reload**: certificate rotation swaps the whole context set in
//!   one publication; in-flight handshakes finish against the old set
//! - **Ticket continuity**: ticket-key seeds carry over across reloads so
//!   resumed sessions still decrypt, and can be rotated in place
//! - **mTLS wiring**: per-entry client-CA trust and verification modes, or
//!   an externally registered verifier
//!
//! # Example
//!
//! ```ignore
//! use zentinel_tls::{CacheOptions, ClientHelloFacts, TlsContextConfig, TlsContextManager};
//!
//! let manager = TlsContextManager::new("vip-443", true, None);
//! let mut config = TlsContextConfig::new("/etc/certs/web.crt", "/etc/certs/web.key");
//! config.is_default = true;
//! manager.reset(&[config], &CacheOptions::default(), None, vip, None)?;
//!
//! // In the accept loop, after the Acceptor has read the ClientHello:
//! let facts = ClientHelloFacts::from_client_hello(&accepted.client_hello());
//! let server_config = manager.select_config(&facts).expect("default context");
//! let conn = accepted.into_connection(server_config)?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod config;
pub mod context;
pub mod errors;
pub mod identity;
pub mod index;
pub mod load;
pub mod manager;
pub mod session;
pub mod stats;
pub mod ticket;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use config::{
    CertificateEntry, ClientVerification, KeyOffloadParams, SniNoMatchFn, TlsContextConfig,
    TlsVersion,
};
pub use context::{KeyOffloadProvider, ServerContext};
pub use errors::{TlsManagerError, TlsResult};
pub use identity::{CertIdentity, CryptoTier};
pub use index::{ContextKey, ContextSet, DomainName};
pub use manager::{ClientHelloFacts, Selection, TlsContextManager};
pub use session::{CacheOptions, SessionCacheProvider};
pub use stats::{AtomicHandshakeStats, HandshakeStats};
pub use ticket::{TicketKeyManager, TicketSeeds};
