//! Certificate, key, and trust-store loading
//!
//! Synchronous disk reads, used only at build/reload time. Every failure
//! names the file that caused it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use tracing::{debug, warn};

use crate::errors::{TlsManagerError, TlsResult};

/// Load a PEM certificate chain, leaf first
pub fn load_cert_chain(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| TlsManagerError::cert_load(path, e))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsManagerError::cert_load(path, e))?;

    if certs.is_empty() {
        return Err(TlsManagerError::cert_load(path, "no certificates found in file"));
    }

    debug!(path = %path.display(), certs = certs.len(), "loaded certificate chain");
    Ok(certs)
}

/// Load a PEM private key, decrypting PKCS#8-encrypted keys when a
/// password file is configured
pub fn load_private_key(
    key_path: &Path,
    password_path: Option<&Path>,
) -> TlsResult<PrivateKeyDer<'static>> {
    if let Some(password_path) = password_path {
        let password = read_password(password_path)?;
        if let Some(key) = load_encrypted_key(key_path, &password)? {
            return Ok(key);
        }
        // The key turned out not to be encrypted; fall through to the
        // normal loader.
        warn!(
            path = %key_path.display(),
            "password file configured but key is not encrypted"
        );
    }

    let file = File::open(key_path).map_err(|e| TlsManagerError::key_load(key_path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsManagerError::key_load(key_path, e))?
        .ok_or_else(|| TlsManagerError::key_load(key_path, "no private key found in file"))
}

/// Load trusted CA certificates for client verification
pub fn load_ca_certs(path: &Path) -> TlsResult<RootCertStore> {
    let file = File::open(path).map_err(|e| TlsManagerError::cert_load(path, e))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsManagerError::cert_load(path, e))?;

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TlsManagerError::cert_load(path, format!("rejected CA certificate: {e}")))?;
    }

    if roots.is_empty() {
        return Err(TlsManagerError::cert_load(path, "no CA certificates found"));
    }

    debug!(path = %path.display(), roots = roots.len(), "loaded client CA certificates");
    Ok(roots)
}

fn read_password(path: &Path) -> TlsResult<String> {
    let raw = std::fs::read_to_string(path).map_err(|e| TlsManagerError::key_load(path, e))?;
    Ok(raw.trim_end_matches(['\r', '\n']).to_string())
}

/// Returns `Ok(None)` when the file holds no encrypted PKCS#8 block
fn load_encrypted_key(
    key_path: &Path,
    password: &str,
) -> TlsResult<Option<PrivateKeyDer<'static>>> {
    let raw = std::fs::read(key_path).map_err(|e| TlsManagerError::key_load(key_path, e))?;
    let blocks =
        pem::parse_many(&raw).map_err(|e| TlsManagerError::key_load(key_path, e))?;

    let Some(block) = blocks.iter().find(|b| b.tag() == "ENCRYPTED PRIVATE KEY") else {
        return Ok(None);
    };

    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(block.contents())
        .map_err(|e| TlsManagerError::key_load(key_path, format!("bad encrypted key: {e}")))?;
    let decrypted = info
        .decrypt(password)
        .map_err(|e| TlsManagerError::key_load(key_path, format!("cannot decrypt key: {e}")))?;

    Ok(Some(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    ))))
}
