//! Per-listener TLS context manager
//!
//! One [`TlsContextManager`] owns every TLS server context for a listening
//! VIP:PORT and answers SNI dispatch during handshakes. The live
//! [`ContextSet`] is replaced atomically on reload: a handshake either sees
//! the entirely-old set or the entirely-new one, and in-flight handshakes
//! keep the old contexts alive through their handles until they complete.
//!
//! Selection runs on the listener's dispatch thread and never blocks;
//! certificate and key loads happen only inside [`reset`](TlsContextManager::reset)
//! and [`add`](TlsContextManager::add).

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::ClientHello;
use rustls::{CipherSuite, ServerConfig, SignatureScheme};
use tracing::{debug, info};

use crate::config::{SniNoMatchFn, TlsContextConfig};
use crate::context::{self, build_context, BuildInputs, KeyOffloadProvider, ServerContext};
use crate::errors::TlsResult;
use crate::identity::CryptoTier;
use crate::index::{ContextSet, DomainName};
use crate::session::{CacheOptions, SessionCacheProvider};
use crate::stats::HandshakeStats;
use crate::ticket::TicketSeeds;

/// Outcome of SNI dispatch
#[derive(Debug, Clone)]
pub enum Selection {
    /// A context covers the requested name; the handle stays valid for the
    /// rest of the handshake even across a concurrent reload
    Found(Arc<ServerContext>),
    /// No context covers the name; the engine decides whether to alert or
    /// fall through to the default context
    NotFound,
}

/// The ClientHello evidence selection runs on.
///
/// Borrowed from [`rustls::server::ClientHello`] in production; tests build
/// it directly.
#[derive(Debug, Clone, Copy)]
pub struct ClientHelloFacts<'a> {
    /// SNI host name, if the extension was present
    pub server_name: Option<&'a str>,
    /// Advertised signature schemes
    pub signature_schemes: &'a [SignatureScheme],
    /// Offered cipher suites
    pub cipher_suites: &'a [CipherSuite],
}

impl<'a> ClientHelloFacts<'a> {
    pub fn from_client_hello(hello: &'a ClientHello<'a>) -> Self {
        ClientHelloFacts {
            server_name: hello.server_name(),
            signature_schemes: hello.signature_schemes(),
            cipher_suites: hello.cipher_suites(),
        }
    }

    pub(crate) fn offers_tls13(&self) -> bool {
        context::offers_tls13(self.cipher_suites)
    }
}

const SHA256_SCHEMES: [SignatureScheme; 3] = [
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::ECDSA_NISTP256_SHA256,
];

/// Crypto tier the client is believed to support.
///
/// A hello advertising no SHA-256-family signature scheme is assumed to be
/// an outdated client; sending SNI at all is taken as proof of a modern
/// stack even when the sigalg list says otherwise.
fn requested_tier(hello: &ClientHelloFacts<'_>) -> CryptoTier {
    if hello.server_name.is_some_and(|name| !name.is_empty()) {
        return CryptoTier::BestAvailable;
    }
    if hello
        .signature_schemes
        .iter()
        .any(|scheme| SHA256_SCHEMES.contains(scheme))
    {
        CryptoTier::BestAvailable
    } else {
        CryptoTier::Weak
    }
}

/// Manages every TLS server context for one listening VIP:PORT
pub struct TlsContextManager {
    vip_name: String,
    strict: bool,
    stats: Option<Arc<dyn HandshakeStats>>,
    live: ArcSwap<ContextSet>,
    no_match: RwLock<Option<Arc<SniNoMatchFn>>>,
    client_cert_verifier: RwLock<Option<Arc<dyn ClientCertVerifier>>>,
    key_offload: RwLock<Option<Arc<dyn KeyOffloadProvider>>>,
}

impl TlsContextManager {
    /// `strict` turns unusable certificate names into build failures
    /// instead of logged skips
    pub fn new(
        vip_name: impl Into<String>,
        strict: bool,
        stats: Option<Arc<dyn HandshakeStats>>,
    ) -> Self {
        Self {
            vip_name: vip_name.into(),
            strict,
            stats,
            live: ArcSwap::from_pointee(ContextSet::default()),
            no_match: RwLock::new(None),
            client_cert_verifier: RwLock::new(None),
            key_offload: RwLock::new(None),
        }
    }

    /// Register a client-certificate verifier that overrides the
    /// per-entry verification mode
    pub fn set_client_cert_verifier(&self, verifier: Arc<dyn ClientCertVerifier>) {
        *self.client_cert_verifier.write().expect("verifier lock") = Some(verifier);
    }

    /// Register the async private-key offload provider
    pub fn set_key_offload(&self, provider: Arc<dyn KeyOffloadProvider>) {
        *self.key_offload.write().expect("offload lock") = Some(provider);
    }

    /// Atomically replace the live context set with one built from
    /// `configs`.
    ///
    /// When `ticket_seeds` is `None`, seeds are carried over from the
    /// first context of the outgoing set that has a ticket manager, so
    /// sessions resumed across the reload still decrypt. Any failure
    /// leaves the live set untouched.
    pub fn reset(
        &self,
        configs: &[TlsContextConfig],
        cache: &CacheOptions,
        ticket_seeds: Option<&TicketSeeds>,
        vip: SocketAddr,
        external_cache: Option<Arc<dyn SessionCacheProvider>>,
    ) -> TlsResult<()> {
        let carried = match ticket_seeds {
            Some(_) => None,
            None => self.carry_over_seeds(),
        };
        let seeds = ticket_seeds.or(carried.as_ref());
        let inputs = self.build_inputs(cache, seeds, vip, external_cache);

        let mut fresh = ContextSet::default();
        let mut hook: Option<Arc<SniNoMatchFn>> = None;
        for config in configs {
            let ctx = build_context(config, &inputs)?;
            fresh.insert(ctx, self.strict)?;
            // Last entry wins, including clearing a hook set by an
            // earlier entry.
            hook = config.sni_no_match.clone();
        }

        *self.no_match.write().expect("no-match hook lock") = hook;
        info!(
            vip = %self.vip_name,
            contexts = fresh.contexts().len(),
            "activating new TLS context set"
        );
        self.live.store(Arc::new(fresh));
        Ok(())
    }

    /// Add one entry to the live set without rebuilding the others.
    ///
    /// This is the path the no-match hook uses to install a certificate
    /// mid-handshake.
    pub fn add(
        &self,
        config: &TlsContextConfig,
        cache: &CacheOptions,
        ticket_seeds: Option<&TicketSeeds>,
        vip: SocketAddr,
        external_cache: Option<Arc<dyn SessionCacheProvider>>,
    ) -> TlsResult<()> {
        let carried = match ticket_seeds {
            Some(_) => None,
            None => self.carry_over_seeds(),
        };
        let seeds = ticket_seeds.or(carried.as_ref());
        let inputs = self.build_inputs(cache, seeds, vip, external_cache);

        let ctx = build_context(config, &inputs)?;
        let mut next = ContextSet::clone(&self.live.load());
        next.insert(ctx, self.strict)?;

        if config.sni_no_match.is_some() {
            *self.no_match.write().expect("no-match hook lock") = config.sni_no_match.clone();
        }
        debug!(vip = %self.vip_name, "added TLS context to live set");
        self.live.store(Arc::new(next));
        Ok(())
    }

    /// SNI dispatch: pick the context for this ClientHello.
    ///
    /// Exact match beats wildcard, the requested tier beats the upgraded
    /// tier, and the no-match hook gets one chance to add a certificate
    /// before the lookup is retried.
    pub fn select(&self, hello: &ClientHelloFacts<'_>) -> Selection {
        let mut live = self.live.load_full();

        let server_name = hello.server_name.filter(|name| !name.is_empty());
        if server_name.is_none() {
            debug!(vip = %self.vip_name, "ClientHello without server name, using default domain");
            if let Some(stats) = &self.stats {
                stats.record_absent_sni();
            }
        }
        let name = match server_name {
            Some(name) => DomainName::new(name),
            None => live.default_domain().clone(),
        };
        let requested = requested_tier(hello);

        let mut hook_attempted = false;
        loop {
            if let Some((ctx, selected)) = live.lookup_with_upgrade(&name, requested) {
                debug!(vip = %self.vip_name, %name, ?requested, ?selected, "SNI match");
                if let Some(stats) = &self.stats {
                    if server_name.is_some() {
                        stats.record_match();
                    }
                    stats.record_tier_selection(requested, selected);
                }
                return Selection::Found(ctx);
            }

            if hook_attempted {
                break;
            }
            let hook = self.no_match.read().expect("no-match hook lock").clone();
            let Some(hook) = hook else { break };
            hook_attempted = true;
            if !hook(name.as_str()) {
                break;
            }
            // The hook claims to have added a matching certificate; retry
            // against the current live set.
            live = self.live.load_full();
        }

        debug!(vip = %self.vip_name, %name, "no TLS context for requested name");
        if server_name.is_some() {
            if let Some(stats) = &self.stats {
                stats.record_no_match();
            }
        }
        Selection::NotFound
    }

    /// Convenience for Acceptor-style accept loops: the selected context's
    /// configuration for this client, falling through to the default
    /// context when nothing matched
    pub fn select_config(&self, hello: &ClientHelloFacts<'_>) -> Option<Arc<ServerConfig>> {
        match self.select(hello) {
            Selection::Found(ctx) => Some(ctx.config_for(hello)),
            Selection::NotFound => self.default_context().map(|ctx| ctx.config_for(hello)),
        }
    }

    /// The context served when SNI is absent or unmatched
    pub fn default_context(&self) -> Option<Arc<ServerContext>> {
        self.live.load().default_context().cloned()
    }

    /// Snapshot of the live contexts, in configuration order
    pub fn contexts(&self) -> Vec<Arc<ServerContext>> {
        self.live.load().contexts().to_vec()
    }

    /// Push new ticket-key seed generations into every live context's
    /// ticket manager, in place. No contexts are rebuilt and the live set
    /// is not swapped.
    pub fn rotate_ticket_keys(
        &self,
        old_seeds: Vec<Vec<u8>>,
        current_seeds: Vec<Vec<u8>>,
        new_seeds: Vec<Vec<u8>>,
    ) {
        let live = self.live.load();
        let mut rotated = 0usize;
        for ctx in live.contexts() {
            if let Some(manager) = ctx.ticket_manager() {
                manager.set_seeds(old_seeds.clone(), current_seeds.clone(), new_seeds.clone());
                rotated += 1;
            }
        }
        info!(vip = %self.vip_name, contexts = rotated, "rotated TLS ticket keys");
    }

    /// Drop every context
    pub fn clear(&self) {
        self.live.store(Arc::new(ContextSet::default()));
    }

    fn carry_over_seeds(&self) -> Option<TicketSeeds> {
        // All contexts carry the same seeds, so the first ticket manager
        // found speaks for the set.
        let live = self.live.load();
        live.contexts()
            .iter()
            .find_map(|ctx| ctx.ticket_manager().map(|manager| manager.seeds()))
    }

    fn build_inputs<'a>(
        &self,
        cache: &'a CacheOptions,
        seeds: Option<&'a TicketSeeds>,
        vip: SocketAddr,
        external_cache: Option<Arc<dyn SessionCacheProvider>>,
    ) -> BuildInputs<'a> {
        BuildInputs {
            cache,
            seeds,
            vip,
            external_cache,
            client_cert_verifier: self
                .client_cert_verifier
                .read()
                .expect("verifier lock")
                .clone(),
            key_offload: self.key_offload.read().expect("offload lock").clone(),
        }
    }
}

impl std::fmt::Debug for TlsContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContextManager")
            .field("vip_name", &self.vip_name)
            .field("strict", &self.strict)
            .field("contexts", &self.live.load().contexts().len())
            .finish()
    }
}
