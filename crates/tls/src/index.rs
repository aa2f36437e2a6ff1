//! Name index and context set
//!
//! The index maps `(domain name, crypto tier)` to a context handle. Wildcard
//! identities are stored in leading-dot form (`*.example.com` is indexed as
//! `.example.com`) so a suffix lookup needs no scanning. The [`ContextSet`]
//! bundles the index with the context list and default-context bookkeeping;
//! it is the unit the manager swaps atomically on reload.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::ServerContext;
use crate::errors::{TlsManagerError, TlsResult};
use crate::identity::CryptoTier;

/// Case-normalized DNS name
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DomainName(String);

impl DomainName {
    pub fn new(name: &str) -> Self {
        DomainName(name.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The portion of the name from its first dot onward, dot included.
    /// This is the key a one-label wildcard would be stored under.
    fn wildcard_suffix(&self) -> Option<DomainName> {
        self.0.find('.').map(|dot| DomainName(self.0[dot..].to_string()))
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sole lookup key of the name index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    pub name: DomainName,
    pub tier: CryptoTier,
}

#[derive(Debug, Clone, Default)]
struct NameIndex {
    map: HashMap<ContextKey, Arc<ServerContext>>,
}

impl NameIndex {
    fn lookup(&self, name: &DomainName, tier: CryptoTier) -> Option<Arc<ServerContext>> {
        self.map
            .get(&ContextKey {
                name: name.clone(),
                tier,
            })
            .cloned()
    }

    /// Overwrite semantics per the insertion rules: a later certificate
    /// replaces an earlier one at the same key, but a weak certificate's
    /// fallback entry never displaces a modern one. Re-inserting the same
    /// handle is tolerated.
    fn insert(&mut self, key: ContextKey, ctx: &Arc<ServerContext>, overwrite: bool) {
        use std::collections::hash_map::Entry;

        match self.map.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(ctx.clone());
            }
            Entry::Occupied(mut slot) => {
                if Arc::ptr_eq(slot.get(), ctx) {
                    debug!(name = %slot.key().name, "duplicate name within one certificate, ignoring");
                } else if overwrite {
                    debug!(name = %slot.key().name, "replacing indexed context");
                    slot.insert(ctx.clone());
                } else {
                    debug!(name = %slot.key().name, "keeping existing indexed context");
                }
            }
        }
    }
}

/// The atomically replaceable unit: every built context, the default
/// context, the default context's domain, and the name index
#[derive(Debug, Clone, Default)]
pub struct ContextSet {
    contexts: Vec<Arc<ServerContext>>,
    default_context: Option<Arc<ServerContext>>,
    default_domain: DomainName,
    index: NameIndex,
}

impl ContextSet {
    /// Index a built context under its CN and every SAN, then append it to
    /// the context list. `strict` turns unusable names into hard errors;
    /// otherwise they are logged and skipped.
    pub(crate) fn insert(&mut self, ctx: Arc<ServerContext>, strict: bool) -> TlsResult<()> {
        if ctx.is_default() && self.default_context.is_some() {
            return Err(TlsManagerError::DuplicateDefault);
        }

        let identity = ctx.identity().clone();

        // A literal `*` CN is served for every name the engine falls
        // through for, so it lives outside the index and must be the
        // default.
        if identity.common_name == "*" {
            if !ctx.is_default() {
                return Err(TlsManagerError::BadWildcard {
                    name: "*".to_string(),
                    reason: "a star-only certificate must be the default".to_string(),
                });
            }
            self.default_context = Some(ctx.clone());
            self.contexts.push(ctx);
            return Ok(());
        }

        self.insert_name(&identity.common_name, identity.tier, &ctx, strict)?;
        for name in identity.alt_names.iter().flatten() {
            self.insert_name(name, identity.tier, &ctx, strict)?;
        }

        if ctx.is_default() {
            self.default_context = Some(ctx.clone());
            self.default_domain = DomainName::new(&identity.common_name);
        }
        self.contexts.push(ctx);
        Ok(())
    }

    fn insert_name(
        &mut self,
        name: &str,
        tier: CryptoTier,
        ctx: &Arc<ServerContext>,
        strict: bool,
    ) -> TlsResult<()> {
        let stored = match wildcard_storage_form(name) {
            Ok(stored) => stored,
            Err(err) if strict => return Err(err),
            Err(err) => {
                warn!(%name, error = %err, "skipping unusable certificate name");
                return Ok(());
            }
        };

        debug!(name = %stored, ?tier, "indexing certificate name");
        self.index.insert(
            ContextKey {
                name: stored.clone(),
                tier,
            },
            ctx,
            true,
        );
        if tier == CryptoTier::Weak {
            // A weak certificate also answers best-available requests for
            // its names, unless a modern certificate already does.
            self.index.insert(
                ContextKey {
                    name: stored,
                    tier: CryptoTier::BestAvailable,
                },
                ctx,
                false,
            );
        }
        Ok(())
    }

    /// Exact match first, then the one-label wildcard suffix, at one tier
    pub(crate) fn lookup(&self, name: &DomainName, tier: CryptoTier) -> Option<Arc<ServerContext>> {
        if let Some(ctx) = self.index.lookup(name, tier) {
            return Some(ctx);
        }
        name.wildcard_suffix()
            .and_then(|suffix| self.index.lookup(&suffix, tier))
    }

    /// Lookup at the requested tier, upgrading a weak request to
    /// best-available rather than failing the handshake
    pub(crate) fn lookup_with_upgrade(
        &self,
        name: &DomainName,
        requested: CryptoTier,
    ) -> Option<(Arc<ServerContext>, CryptoTier)> {
        if let Some(ctx) = self.lookup(name, requested) {
            return Some((ctx, requested));
        }
        if requested != CryptoTier::BestAvailable {
            if let Some(ctx) = self.lookup(name, CryptoTier::BestAvailable) {
                return Some((ctx, CryptoTier::BestAvailable));
            }
        }
        None
    }

    pub fn contexts(&self) -> &[Arc<ServerContext>] {
        &self.contexts
    }

    pub fn default_context(&self) -> Option<&Arc<ServerContext>> {
        self.default_context.as_ref()
    }

    pub fn default_domain(&self) -> &DomainName {
        &self.default_domain
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn indexed_names(&self) -> usize {
        self.index.map.len()
    }
}

fn wildcard_storage_form(name: &str) -> TlsResult<DomainName> {
    let normalized = name.trim().to_ascii_lowercase();

    // Only wildcards prefixed exactly by `*.` are supported; the leading
    // star is stripped so the stored form begins with the dot.
    let stripped = if normalized.len() > 2 && normalized.starts_with('*') {
        match normalized.strip_prefix("*.") {
            Some(rest) => format!(".{rest}"),
            None => {
                return Err(TlsManagerError::BadWildcard {
                    name: name.to_string(),
                    reason: "only '.' may follow a leading '*'".to_string(),
                })
            }
        }
    } else {
        normalized
    };

    if stripped.is_empty() || stripped == "." {
        return Err(TlsManagerError::BadWildcard {
            name: name.to_string(),
            reason: "name is empty after normalization".to_string(),
        });
    }
    if stripped.contains('*') {
        return Err(TlsManagerError::BadWildcard {
            name: name.to_string(),
            reason: "'*' allowed only as the leading label".to_string(),
        });
    }

    Ok(DomainName(stripped))
}
