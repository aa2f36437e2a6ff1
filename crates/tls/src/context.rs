//! TLS server context construction
//!
//! Turns one [`TlsContextConfig`] entry into a fully wired
//! [`ServerContext`]: certificates loaded and identity-checked, key material
//! acquired (locally or through an offload provider), cipher policy
//! resolved and validated, client authentication, session cache, and ticket
//! manager attached. Build failures carry the offending path; the live set
//! is never touched by a failed build.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs::kx_group;
use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::pki_types::CertificateDer;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{ClientHello, ResolvesServerCert, StoresServerSessions, WebPkiClientVerifier};
use rustls::sign::{CertifiedKey, SigningKey};
use rustls::{version, CipherSuite, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use tracing::debug;

use crate::config::{ClientVerification, KeyOffloadParams, TlsContextConfig, TlsVersion};
use crate::errors::{TlsManagerError, TlsResult};
use crate::identity::{self, CertIdentity};
use crate::load;
use crate::manager::ClientHelloFacts;
use crate::session::{self, CacheOptions, SessionCacheProvider};
use crate::ticket::{TicketKeyManager, TicketSeeds};

/// Large enough that a certificate chain fits a single record; some old
/// clients cannot reassemble certificates across records.
const MAX_SEND_FRAGMENT: usize = 8000;

/// External provider of signing keys whose private material lives outside
/// this process (HSM, signing service). Registered on the manager; consulted
/// when an entry requests key offload.
pub trait KeyOffloadProvider: fmt::Debug + Send + Sync {
    fn signing_key(
        &self,
        params: &KeyOffloadParams,
        chain: &[CertificateDer<'static>],
    ) -> Result<Arc<dyn SigningKey>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Picks among the entry's certified keys (e.g. RSA and ECDSA for the same
/// identity) by the client's advertised signature schemes
#[derive(Debug)]
struct EntryCertResolver {
    keys: Vec<Arc<CertifiedKey>>,
}

impl ResolvesServerCert for EntryCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let schemes = client_hello.signature_schemes();
        self.keys
            .iter()
            .find(|ck| ck.key.choose_scheme(schemes).is_some())
            .cloned()
    }
}

/// A fully configured TLS server context for one certificate identity group.
///
/// Immutable after construction; ticket-key rotation mutates only the
/// attached ticket manager. Handles stay valid for in-flight handshakes
/// after the owning set has been swapped out.
pub struct ServerContext {
    pub(crate) identity: CertIdentity,
    pub(crate) is_default: bool,
    config: Arc<ServerConfig>,
    legacy_config: Option<Arc<ServerConfig>>,
    ticket_manager: Option<Arc<TicketKeyManager>>,
}

impl ServerContext {
    pub fn identity(&self) -> &CertIdentity {
        &self.identity
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// The primary rustls configuration
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    /// The configuration served to pre-TLS-1.3 clients, when a legacy
    /// cipher list is configured
    pub fn legacy_server_config(&self) -> Option<Arc<ServerConfig>> {
        self.legacy_config.clone()
    }

    pub fn ticket_manager(&self) -> Option<&Arc<TicketKeyManager>> {
        self.ticket_manager.as_ref()
    }

    /// The configuration to finish this client's handshake with: the legacy
    /// cipher list applies when the ClientHello offers no TLS 1.3 suite
    pub fn config_for(&self, hello: &ClientHelloFacts<'_>) -> Arc<ServerConfig> {
        match &self.legacy_config {
            Some(legacy) if !hello.offers_tls13() => legacy.clone(),
            _ => self.config.clone(),
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("identity", &self.identity)
            .field("is_default", &self.is_default)
            .field("has_legacy_config", &self.legacy_config.is_some())
            .finish()
    }
}

/// Collaborators and listener-level parameters a build runs against
pub(crate) struct BuildInputs<'a> {
    pub cache: &'a CacheOptions,
    pub seeds: Option<&'a TicketSeeds>,
    pub vip: SocketAddr,
    pub external_cache: Option<Arc<dyn SessionCacheProvider>>,
    pub client_cert_verifier: Option<Arc<dyn ClientCertVerifier>>,
    pub key_offload: Option<Arc<dyn KeyOffloadProvider>>,
}

/// Build one server context from a configuration entry
pub(crate) fn build_context(
    config: &TlsContextConfig,
    inputs: &BuildInputs<'_>,
) -> TlsResult<Arc<ServerContext>> {
    if config.certificates.is_empty() {
        return Err(TlsManagerError::cert_load(
            "<none>",
            "certificate entry lists no certificate files",
        ));
    }

    let provider = rustls::crypto::aws_lc_rs::default_provider();

    // Load every certificate in the entry. All of them must present the
    // same identity so one name can be served by multiple key types.
    let mut keys: Vec<Arc<CertifiedKey>> = Vec::with_capacity(config.certificates.len());
    let mut identity: Option<CertIdentity> = None;
    let mut last_path: Option<&Path> = None;
    for entry in &config.certificates {
        let chain = load::load_cert_chain(&entry.cert_path)?;
        let cert_identity = identity::extract(&chain[0], &entry.cert_path)?;
        debug!(
            path = %entry.cert_path.display(),
            cn = %cert_identity.common_name,
            sans = ?cert_identity.alt_names,
            tier = ?cert_identity.tier,
            "loaded certificate"
        );

        match &identity {
            None => identity = Some(cert_identity),
            Some(first) if first.same_identity(&cert_identity) => {}
            Some(_) => {
                return Err(TlsManagerError::IdentityMismatch {
                    path: entry.cert_path.clone(),
                    other: last_path.expect("previous certificate path").into(),
                })
            }
        }

        let signing_key: Arc<dyn SigningKey> = if config.wants_key_offload() {
            let offload = inputs.key_offload.as_ref().ok_or_else(|| {
                TlsManagerError::MissingFeature {
                    feature: "key offload",
                    detail: "entry requests offload but no provider is registered".to_string(),
                }
            })?;
            offload
                .signing_key(&config.key_offload_params, &chain)
                .map_err(|e| TlsManagerError::key_load(&entry.cert_path, e))?
        } else {
            let key = load::load_private_key(&entry.key_path, entry.password_path.as_deref())?;
            provider
                .key_provider
                .load_private_key(key)
                .map_err(|e| TlsManagerError::key_load(&entry.key_path, e))?
        };

        keys.push(Arc::new(CertifiedKey::new(chain, signing_key)));
        last_path = Some(&entry.cert_path);
    }
    let identity = identity.expect("at least one certificate");
    let resolver: Arc<dyn ResolvesServerCert> = Arc::new(EntryCertResolver { keys });

    // Resolve the legacy lists before the primary list so a bad legacy
    // list fails the build rather than the first old-client handshake.
    let legacy_suites = resolve_legacy_suites(config, &provider)?;
    let primary_suites = if config.cipher_suites.is_empty() {
        provider.cipher_suites.clone()
    } else {
        resolve_cipher_list(&config.cipher_suites, &provider)?
    };

    let kx_groups = config
        .ecdh_curve
        .as_deref()
        .map(resolve_kx_group)
        .transpose()?;

    let verifier: Arc<dyn ClientCertVerifier> = match &config.client_ca_file {
        Some(ca_path) => {
            let roots = load::load_ca_certs(ca_path)?;
            match &inputs.client_cert_verifier {
                // An externally registered verify callback wins over the
                // configured mode.
                Some(external) => external.clone(),
                None => build_client_verifier(roots, config.client_verification, &provider, ca_path)?,
            }
        }
        None => WebPkiClientVerifier::no_client_auth(),
    };

    let storage = session::build_session_storage(
        inputs.cache,
        inputs.vip,
        inputs.external_cache.clone(),
        &identity.common_name,
    );

    let ticket_manager = if config.session_ticket_enabled {
        let seeds = inputs.seeds.cloned().unwrap_or_default();
        Some(Arc::new(TicketKeyManager::new(
            seeds,
            inputs.cache.ticket_lifetime(),
        )))
    } else {
        None
    };

    let primary = assemble_config(
        config,
        &provider,
        primary_suites,
        kx_groups.clone(),
        protocol_versions(config.min_version, config.max_version),
        verifier.clone(),
        resolver.clone(),
        storage.clone(),
        ticket_manager.clone(),
    )?;

    let legacy_config = legacy_suites
        .map(|suites| {
            assemble_config(
                config,
                &provider,
                suites,
                kx_groups,
                &[&version::TLS12],
                verifier,
                resolver,
                storage,
                ticket_manager.clone(),
            )
        })
        .transpose()?;

    Ok(Arc::new(ServerContext {
        identity,
        is_default: config.is_default,
        config: primary,
        legacy_config,
        ticket_manager,
    }))
}

#[allow(clippy::too_many_arguments)]
fn assemble_config(
    config: &TlsContextConfig,
    base: &CryptoProvider,
    suites: Vec<SupportedCipherSuite>,
    kx_groups: Option<Vec<&'static dyn SupportedKxGroup>>,
    versions: &[&'static SupportedProtocolVersion],
    verifier: Arc<dyn ClientCertVerifier>,
    resolver: Arc<dyn ResolvesServerCert>,
    storage: Arc<dyn StoresServerSessions>,
    ticket_manager: Option<Arc<TicketKeyManager>>,
) -> TlsResult<Arc<ServerConfig>> {
    let mut provider = base.clone();
    provider.cipher_suites = suites;
    if let Some(kx_groups) = kx_groups {
        provider.kx_groups = kx_groups;
    }

    let builder = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(versions)
        .map_err(|e| TlsManagerError::InvalidCipherList {
            detail: e.to_string(),
        })?;

    let mut server_config = builder
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(resolver);

    server_config.ignore_client_order = true;
    server_config.max_fragment_size = Some(MAX_SEND_FRAGMENT);
    server_config.session_storage = storage;
    server_config.alpn_protocols = config
        .alpn_protocols
        .iter()
        .map(|proto| proto.as_bytes().to_vec())
        .collect();
    if let Some(ticket_manager) = ticket_manager {
        server_config.ticketer = ticket_manager;
    }

    Ok(Arc::new(server_config))
}

/// A ceiling below the floor is clamped to the floor
fn protocol_versions(
    min: TlsVersion,
    max: Option<TlsVersion>,
) -> &'static [&'static SupportedProtocolVersion] {
    static TLS12_ONLY: [&SupportedProtocolVersion; 1] = [&version::TLS12];
    static TLS13_ONLY: [&SupportedProtocolVersion; 1] = [&version::TLS13];
    match (min, max) {
        (TlsVersion::Tls12, Some(TlsVersion::Tls12)) => &TLS12_ONLY,
        (TlsVersion::Tls12, _) => rustls::ALL_VERSIONS,
        (TlsVersion::Tls13, _) => &TLS13_ONLY,
    }
}

fn resolve_cipher_list(
    names: &[String],
    provider: &CryptoProvider,
) -> TlsResult<Vec<SupportedCipherSuite>> {
    names
        .iter()
        .map(|name| {
            provider
                .cipher_suites
                .iter()
                .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
                .copied()
                .ok_or_else(|| TlsManagerError::InvalidCipherList {
                    detail: format!("unknown cipher suite {name:?}"),
                })
        })
        .collect()
}

fn resolve_legacy_suites(
    config: &TlsContextConfig,
    provider: &CryptoProvider,
) -> TlsResult<Option<Vec<SupportedCipherSuite>>> {
    if config.legacy_cipher_suites.is_empty() && config.legacy_alt_cipher_suites.is_empty() {
        return Ok(None);
    }

    let mut suites = resolve_cipher_list(&config.legacy_cipher_suites, provider)?;
    for suite in resolve_cipher_list(&config.legacy_alt_cipher_suites, provider)? {
        if !suites.iter().any(|s| s.suite() == suite.suite()) {
            suites.push(suite);
        }
    }
    Ok(Some(suites))
}

fn build_client_verifier(
    roots: rustls::RootCertStore,
    mode: ClientVerification,
    provider: &CryptoProvider,
    ca_path: &Path,
) -> TlsResult<Arc<dyn ClientCertVerifier>> {
    if mode == ClientVerification::Disabled {
        return Ok(WebPkiClientVerifier::no_client_auth());
    }

    let builder =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::new(provider.clone()));
    let builder = match mode {
        ClientVerification::Required => builder,
        ClientVerification::Optional => builder.allow_unauthenticated(),
        ClientVerification::Disabled => unreachable!(),
    };
    builder
        .build()
        .map_err(|e| TlsManagerError::cert_load(ca_path, format!("cannot build client verifier: {e}")))
}

fn resolve_kx_group(name: &str) -> TlsResult<Vec<&'static dyn SupportedKxGroup>> {
    let group: &'static dyn SupportedKxGroup = match name.to_ascii_lowercase().as_str() {
        "x25519" => kx_group::X25519,
        "secp256r1" | "prime256v1" | "p-256" => kx_group::SECP256R1,
        "secp384r1" | "p-384" => kx_group::SECP384R1,
        _ => {
            return Err(TlsManagerError::UnknownCurve {
                name: name.to_string(),
            })
        }
    };
    Ok(vec![group])
}

/// TLS 1.3 suite identifiers, used to spot clients that cannot speak 1.3
const TLS13_SUITES: [CipherSuite; 3] = [
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
];

pub(crate) fn offers_tls13(cipher_suites: &[CipherSuite]) -> bool {
    cipher_suites.iter().any(|cs| TLS13_SUITES.contains(cs))
}
