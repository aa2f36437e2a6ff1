//! Handshake selection statistics
//!
//! The manager reports selection outcomes through the [`HandshakeStats`]
//! trait; [`AtomicHandshakeStats`] is a ready-made sink for exporters that
//! scrape counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::identity::CryptoTier;

/// Sink for SNI selection outcomes
pub trait HandshakeStats: fmt::Debug + Send + Sync {
    /// ClientHello carried no server name
    fn record_absent_sni(&self);
    /// A named lookup found a context
    fn record_match(&self);
    /// A named lookup found nothing, even after the no-match hook
    fn record_no_match(&self);
    /// Tier the client was believed to need vs. tier actually served
    fn record_tier_selection(&self, requested: CryptoTier, selected: CryptoTier);
}

/// Counter-based [`HandshakeStats`] implementation
#[derive(Debug, Default)]
pub struct AtomicHandshakeStats {
    absent_sni: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    weak_served: AtomicU64,
    tier_upgraded: AtomicU64,
}

impl AtomicHandshakeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absent_sni(&self) -> u64 {
        self.absent_sni.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Handshakes served a SHA-1-family certificate
    pub fn weak_served(&self) -> u64 {
        self.weak_served.load(Ordering::Relaxed)
    }

    /// Handshakes where a weak request was answered with a stronger cert
    pub fn tier_upgraded(&self) -> u64 {
        self.tier_upgraded.load(Ordering::Relaxed)
    }
}

impl HandshakeStats for AtomicHandshakeStats {
    fn record_absent_sni(&self) {
        self.absent_sni.fetch_add(1, Ordering::Relaxed);
    }

    fn record_match(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_no_match(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tier_selection(&self, requested: CryptoTier, selected: CryptoTier) {
        if selected == CryptoTier::Weak {
            self.weak_served.fetch_add(1, Ordering::Relaxed);
        }
        if requested == CryptoTier::Weak && selected == CryptoTier::BestAvailable {
            self.tier_upgraded.fetch_add(1, Ordering::Relaxed);
        }
    }
}
