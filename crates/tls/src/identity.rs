//! Certificate identity extraction
//!
//! Pulls the Common Name, Subject Alternative DNS names, and a signature
//! strength classification out of a parsed certificate. The classification
//! drives the second selection axis: SHA-1-family certificates are offered
//! only to clients that cannot handle anything better.

use std::path::Path;
use std::time::{Duration, SystemTime};

use rustls::pki_types::CertificateDer;
use tracing::warn;
use x509_parser::oid_registry::asn1_rs::oid;
use x509_parser::oid_registry::OID_PKCS1_SHA1WITHRSA;

/// ecdsa-with-SHA1 (1.2.840.10045.4.1) — not exposed as a named constant by
/// the `oid-registry` version in use, so it is constructed directly.
const OID_SIG_ECDSA_WITH_SHA1: x509_parser::oid_registry::asn1_rs::Oid<'static> =
    oid!(1.2.840 .10045 .4 .1);
use x509_parser::prelude::*;

use crate::errors::{TlsManagerError, TlsResult};

/// Signature strength classification of a certificate.
///
/// A closed two-point lattice: `Weak < BestAvailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CryptoTier {
    /// RSA-SHA1 or ECDSA-SHA1 signature
    Weak,
    /// Anything else
    BestAvailable,
}

/// Identity record of one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    /// Lowercased Common Name
    pub common_name: String,
    /// Lowercased, sorted SAN DNS names; `None` when the certificate
    /// carries no SAN extension
    pub alt_names: Option<Vec<String>>,
    /// Signature strength
    pub tier: CryptoTier,
}

impl CertIdentity {
    /// All names this certificate binds, CN first
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.common_name.as_str())
            .chain(self.alt_names.iter().flatten().map(String::as_str))
    }

    /// Whether two certificates present the same identity (same CN and,
    /// when either carries SANs, byte-equal sorted SAN lists)
    pub fn same_identity(&self, other: &CertIdentity) -> bool {
        self.common_name == other.common_name && self.alt_names == other.alt_names
    }
}

const EXPIRY_WARNING: Duration = Duration::from_secs(30 * 86400);

/// Extract the identity record from a DER certificate.
///
/// Rejects certificates with no extractable Common Name and certificates
/// that are already expired; warns when expiry is near.
pub fn extract(cert: &CertificateDer<'_>, path: &Path) -> TlsResult<CertIdentity> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| TlsManagerError::cert_load(path, format!("malformed X509: {e}")))?;

    check_validity(&parsed, path)?;

    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(canonical)
        .ok_or_else(|| TlsManagerError::IdentityMissing { path: path.into() })?;

    let alt_names = match parsed.subject_alternative_name() {
        Ok(Some(ext)) => {
            let mut names: Vec<String> = ext
                .value
                .general_names
                .iter()
                .filter_map(|gn| match gn {
                    GeneralName::DNSName(name) => Some(canonical(name)),
                    _ => None,
                })
                .collect();
            names.sort();
            Some(names)
        }
        Ok(None) => None,
        Err(e) => {
            return Err(TlsManagerError::cert_load(
                path,
                format!("bad subjectAltName extension: {e}"),
            ))
        }
    };

    let sig_alg = &parsed.signature_algorithm.algorithm;
    let tier = if *sig_alg == OID_PKCS1_SHA1WITHRSA || *sig_alg == OID_SIG_ECDSA_WITH_SHA1 {
        CryptoTier::Weak
    } else {
        CryptoTier::BestAvailable
    };

    Ok(CertIdentity {
        common_name,
        alt_names,
        tier,
    })
}

fn check_validity(cert: &X509Certificate<'_>, path: &Path) -> TlsResult<()> {
    let not_after = cert.validity().not_after;
    let expires_at = SystemTime::UNIX_EPOCH + Duration::from_secs(not_after.timestamp().max(0) as u64);
    let now = SystemTime::now();

    if expires_at < now {
        return Err(TlsManagerError::cert_load(
            path,
            format!("certificate expired at {not_after}"),
        ));
    }
    if expires_at < now + EXPIRY_WARNING {
        warn!(path = %path.display(), expires = %not_after, "certificate expires soon");
    }
    Ok(())
}

fn canonical(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
