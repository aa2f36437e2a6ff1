//! Shared helpers for integration tests: crypto provider setup, fixture
//! paths, and rcgen certificate generation.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use rcgen::{CertificateParams, CertifiedIssuer, DistinguishedName, DnType, KeyPair, SanType};

use zentinel_tls::{CacheOptions, TlsContextConfig};

static CRYPTO_PROVIDER_INIT: Once = Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Get the path to the test fixtures directory
pub fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

pub fn vip() -> std::net::SocketAddr {
    "127.0.0.1:8443".parse().unwrap()
}

pub fn cache_options() -> CacheOptions {
    CacheOptions::default()
}

/// Write a self-signed certificate and key into `dir`, returning the paths
pub fn write_self_signed(dir: &Path, stem: &str, cn: &str, sans: &[&str]) -> (PathBuf, PathBuf) {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.subject_alt_names = sans
        .iter()
        .map(|san| SanType::DnsName((*san).try_into().unwrap()))
        .collect();

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let cert_path = dir.join(format!("{stem}.crt"));
    let key_path = dir.join(format!("{stem}.key"));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

/// Generate a CA for handshake tests
pub fn generate_ca() -> CertifiedIssuer<'static, KeyPair> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Test CA");
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate().unwrap();
    CertifiedIssuer::self_signed(params, key_pair).unwrap()
}

/// Issue a CA-signed certificate covering `cn` and `sans`
pub fn issue_cert(
    ca: &CertifiedIssuer<'static, KeyPair>,
    cn: &str,
    sans: &[&str],
) -> (rcgen::Certificate, KeyPair) {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.subject_alt_names = sans
        .iter()
        .map(|san| SanType::DnsName((*san).try_into().unwrap()))
        .collect();

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key_pair, ca).unwrap();
    (cert, key_pair)
}

/// Issue a CA-signed client-auth certificate
pub fn issue_client_cert(
    ca: &CertifiedIssuer<'static, KeyPair>,
    cn: &str,
) -> (rcgen::Certificate, KeyPair) {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key_pair, ca).unwrap();
    (cert, key_pair)
}

/// Write a CA-signed certificate and key into `dir`, returning the paths
pub fn write_issued(
    ca: &CertifiedIssuer<'static, KeyPair>,
    dir: &Path,
    stem: &str,
    cn: &str,
    sans: &[&str],
) -> (PathBuf, PathBuf) {
    let (cert, key_pair) = issue_cert(ca, cn, sans);
    let cert_path = dir.join(format!("{stem}.crt"));
    let key_path = dir.join(format!("{stem}.key"));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

/// Config for one self-signed cert written into `dir`
pub fn config_for(dir: &Path, stem: &str, cn: &str, sans: &[&str]) -> TlsContextConfig {
    let (cert_path, key_path) = write_self_signed(dir, stem, cn, sans);
    TlsContextConfig::new(cert_path, key_path)
}
