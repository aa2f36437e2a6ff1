//! Session ticket key management
//!
//! Ticket keys are derived from opaque seed strings so that every context on
//! a listener, and every process serving the same VIP, can mint and accept
//! the same tickets. Three seed generations are kept: `current` mints new
//! tickets, `old` still decrypts tickets from before the last rotation, and
//! `new` pre-positions the next generation so peers can roll forward without
//! a flag day.

use std::fmt;
use std::sync::RwLock;

use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use aws_lc_rs::digest;
use aws_lc_rs::hkdf;
use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use rustls::server::ProducesTickets;
use tracing::debug;

const KEY_NAME_LEN: usize = 16;
const AEAD_KEY_LEN: usize = 32;
const KEY_EXPANSION_INFO: &[&[u8]] = &[b"ticket key expansion"];

/// Ticket key seed generations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketSeeds {
    /// Decrypt-only seeds from before the last rotation
    pub old_seeds: Vec<Vec<u8>>,
    /// Seeds used to mint new tickets
    pub current_seeds: Vec<Vec<u8>>,
    /// Pre-positioned seeds for the next rotation
    pub new_seeds: Vec<Vec<u8>>,
}

impl TicketSeeds {
    pub fn is_empty(&self) -> bool {
        self.old_seeds.is_empty() && self.current_seeds.is_empty() && self.new_seeds.is_empty()
    }

    /// A single random current seed, used when no seeds are configured so
    /// resumption still works within this process lifetime
    fn random(rng: &SystemRandom) -> Self {
        let mut seed = vec![0u8; 32];
        rng.fill(&mut seed).expect("system rng");
        TicketSeeds {
            old_seeds: Vec::new(),
            current_seeds: vec![seed],
            new_seeds: Vec::new(),
        }
    }
}

struct TicketKey {
    name: [u8; KEY_NAME_LEN],
    key: LessSafeKey,
}

impl TicketKey {
    /// Derive the key name and AEAD key for one seed
    fn derive(seed: &[u8]) -> TicketKey {
        let mut name = [0u8; KEY_NAME_LEN];
        name.copy_from_slice(&digest::digest(&digest::SHA256, seed).as_ref()[..KEY_NAME_LEN]);

        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(seed);
        let okm = prk
            .expand(KEY_EXPANSION_INFO, hkdf::HKDF_SHA256)
            .expect("hkdf expand");
        let mut key_bytes = [0u8; AEAD_KEY_LEN];
        okm.fill(&mut key_bytes).expect("hkdf fill");

        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes).expect("aead key");
        TicketKey {
            name,
            key: LessSafeKey::new(unbound),
        }
    }
}

struct KeyRing {
    seeds: TicketSeeds,
    /// Key tickets are minted with
    encrypt: Option<TicketKey>,
    /// All keys accepted for decryption, current generation first
    decrypt: Vec<TicketKey>,
}

impl KeyRing {
    fn from_seeds(seeds: TicketSeeds) -> KeyRing {
        let decrypt: Vec<TicketKey> = seeds
            .current_seeds
            .iter()
            .chain(seeds.new_seeds.iter())
            .chain(seeds.old_seeds.iter())
            .map(|seed| TicketKey::derive(seed))
            .collect();
        let encrypt = seeds
            .current_seeds
            .first()
            .or_else(|| seeds.new_seeds.first())
            .map(|seed| TicketKey::derive(seed));
        KeyRing {
            seeds,
            encrypt,
            decrypt,
        }
    }
}

/// Seed-derived ticket encryption for one TLS server context.
///
/// Immutable after attachment except for [`set_seeds`](Self::set_seeds),
/// which is the rotation path: readers racing a rotation simply try the
/// updated ring.
pub struct TicketKeyManager {
    ring: RwLock<KeyRing>,
    lifetime: u32,
    rng: SystemRandom,
}

impl TicketKeyManager {
    /// Build a manager from the given seeds; falls back to a random
    /// current seed when none are configured
    pub fn new(seeds: TicketSeeds, lifetime: u32) -> TicketKeyManager {
        let rng = SystemRandom::new();
        let seeds = if seeds.is_empty() {
            debug!("no ticket seeds configured, generating a random seed");
            TicketSeeds::random(&rng)
        } else {
            seeds
        };
        TicketKeyManager {
            ring: RwLock::new(KeyRing::from_seeds(seeds)),
            lifetime,
            rng,
        }
    }

    /// Current seed generations
    pub fn seeds(&self) -> TicketSeeds {
        self.ring.read().expect("ticket ring lock").seeds.clone()
    }

    /// Replace all seed generations in place. This is the ticket-key
    /// rotation path; contexts are not rebuilt.
    pub fn set_seeds(
        &self,
        old_seeds: Vec<Vec<u8>>,
        current_seeds: Vec<Vec<u8>>,
        new_seeds: Vec<Vec<u8>>,
    ) {
        let seeds = TicketSeeds {
            old_seeds,
            current_seeds,
            new_seeds,
        };
        *self.ring.write().expect("ticket ring lock") = KeyRing::from_seeds(seeds);
    }
}

impl ProducesTickets for TicketKeyManager {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        self.lifetime
    }

    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        let ring = self.ring.read().ok()?;
        let key = ring.encrypt.as_ref()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).ok()?;

        let mut sealed = plain.to_vec();
        key.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut sealed,
            )
            .ok()?;

        let mut ticket = Vec::with_capacity(KEY_NAME_LEN + NONCE_LEN + sealed.len());
        ticket.extend_from_slice(&key.name);
        ticket.extend_from_slice(&nonce_bytes);
        ticket.extend_from_slice(&sealed);
        Some(ticket)
    }

    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>> {
        if cipher.len() < KEY_NAME_LEN + NONCE_LEN {
            return None;
        }
        let (name, rest) = cipher.split_at(KEY_NAME_LEN);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);

        let ring = self.ring.read().ok()?;
        let key = ring.decrypt.iter().find(|k| k.name.as_slice() == name)?;

        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).ok()?;
        let mut in_out = sealed.to_vec();
        let plain = key.key.open_in_place(nonce, Aad::empty(), &mut in_out).ok()?;
        Some(plain.to_vec())
    }
}

impl fmt::Debug for TicketKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.read().expect("ticket ring lock");
        f.debug_struct("TicketKeyManager")
            .field("decrypt_keys", &ring.decrypt.len())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}
