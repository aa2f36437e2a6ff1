//! End-to-End Handshake Tests
//!
//! Complete real rustls handshakes against the manager through the
//! Acceptor flow an accept loop would use: read the ClientHello, ask the
//! manager for the context, finish the handshake with the selected
//! configuration, and verify the certificate actually presented.

mod common;

use std::sync::Arc;

use rcgen::{CertifiedIssuer, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::Acceptor;
use rustls::{
    CipherSuite, ClientConfig, ClientConnection, HandshakeKind, RootCertStore, ServerConnection,
};

use zentinel_tls::{ClientHelloFacts, ClientVerification, TlsContextConfig, TlsContextManager};

use common::{cache_options, ensure_crypto_provider, generate_ca, vip, write_issued};

// ============================================================================
// Handshake Plumbing
// ============================================================================

fn client_config(ca: &CertifiedIssuer<'static, KeyPair>) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.as_ref().der().to_vec()))
        .unwrap();
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Drive one handshake through the Acceptor + manager selection path
fn run_handshake(
    manager: &TlsContextManager,
    client_config: Arc<ClientConfig>,
    server_name: &str,
) -> (ClientConnection, ServerConnection) {
    let mut client = ClientConnection::new(
        client_config,
        ServerName::try_from(server_name.to_string()).unwrap(),
    )
    .unwrap();

    let mut first_flight = Vec::new();
    while client.wants_write() {
        client.write_tls(&mut first_flight).unwrap();
    }

    let mut acceptor = Acceptor::default();
    let mut cursor: &[u8] = &first_flight;
    let accepted = loop {
        acceptor.read_tls(&mut cursor).unwrap();
        match acceptor.accept() {
            Ok(Some(accepted)) => break accepted,
            Ok(None) => continue,
            Err((err, _alert)) => panic!("accept failed: {err}"),
        }
    };

    let config = {
        let hello = accepted.client_hello();
        let facts = ClientHelloFacts::from_client_hello(&hello);
        manager.select_config(&facts).expect("a server config")
    };
    let mut server = accepted
        .into_connection(config)
        .map_err(|(err, _alert)| err)
        .unwrap();

    complete_handshake(&mut client, &mut server);
    (client, server)
}

/// Pump bytes both ways until the handshake (and any post-handshake
/// messages, e.g. session tickets) are fully delivered
fn complete_handshake(client: &mut ClientConnection, server: &mut ServerConnection) {
    loop {
        let mut progressed = false;

        if client.wants_write() {
            let mut buf = Vec::new();
            while client.wants_write() {
                client.write_tls(&mut buf).unwrap();
            }
            let mut rd: &[u8] = &buf;
            while !rd.is_empty() {
                server.read_tls(&mut rd).unwrap();
            }
            server.process_new_packets().unwrap();
            progressed = true;
        }

        if server.wants_write() {
            let mut buf = Vec::new();
            while server.wants_write() {
                server.write_tls(&mut buf).unwrap();
            }
            let mut rd: &[u8] = &buf;
            while !rd.is_empty() {
                client.read_tls(&mut rd).unwrap();
            }
            client.process_new_packets().unwrap();
            progressed = true;
        }

        if !progressed {
            assert!(!client.is_handshaking(), "handshake stalled on client side");
            assert!(!server.is_handshaking(), "handshake stalled on server side");
            break;
        }
    }
}

fn presented_cert(client: &ClientConnection) -> Vec<u8> {
    client.peer_certificates().unwrap()[0].to_vec()
}

// ============================================================================
// Certificate Selection
// ============================================================================

#[test]
fn test_sni_selects_the_right_certificate() {
    ensure_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca();
    let manager = TlsContextManager::new("vip", true, None);

    let (web_cert, web_key) = write_issued(&ca, dir.path(), "web", "web.example", &["web.example"]);
    let (api_cert, api_key) = write_issued(&ca, dir.path(), "api", "api.example", &["api.example"]);

    let mut web = TlsContextConfig::new(web_cert.clone(), web_key);
    web.is_default = true;
    let api = TlsContextConfig::new(api_cert.clone(), api_key);
    manager
        .reset(&[web, api], &cache_options(), None, vip(), None)
        .unwrap();

    let config = Arc::new(client_config(&ca));

    let (client, _server) = run_handshake(&manager, config.clone(), "web.example");
    let web_der = std::fs::read_to_string(&web_cert).unwrap();
    assert_eq!(
        presented_cert(&client),
        pem::parse(web_der).unwrap().into_contents()
    );

    let (client, _server) = run_handshake(&manager, config, "api.example");
    let api_der = std::fs::read_to_string(&api_cert).unwrap();
    assert_eq!(
        presented_cert(&client),
        pem::parse(api_der).unwrap().into_contents()
    );
}

#[test]
fn test_wildcard_certificate_handshake() {
    ensure_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca();
    let manager = TlsContextManager::new("vip", true, None);

    let (cert, key) = write_issued(&ca, dir.path(), "wild", "*.api.example", &["*.api.example"]);
    let mut config = TlsContextConfig::new(cert.clone(), key);
    config.is_default = true;
    manager
        .reset(&[config], &cache_options(), None, vip(), None)
        .unwrap();

    let (client, _server) =
        run_handshake(&manager, Arc::new(client_config(&ca)), "foo.api.example");
    let wild_pem = std::fs::read_to_string(&cert).unwrap();
    assert_eq!(
        presented_cert(&client),
        pem::parse(wild_pem).unwrap().into_contents()
    );
}

#[test]
fn test_absent_sni_serves_default_context() {
    ensure_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca();
    let manager = TlsContextManager::new("vip", true, None);

    let (default_cert, default_key) =
        write_issued(&ca, dir.path(), "default", "web.example", &["web.example"]);
    let (other_cert, other_key) =
        write_issued(&ca, dir.path(), "other", "other.example", &["other.example"]);

    let mut default_config = TlsContextConfig::new(default_cert.clone(), default_key);
    default_config.is_default = true;
    let other_config = TlsContextConfig::new(other_cert, other_key);
    manager
        .reset(
            &[default_config, other_config],
            &cache_options(),
            None,
            vip(),
            None,
        )
        .unwrap();

    let mut config = client_config(&ca);
    config.enable_sni = false;
    let (client, _server) = run_handshake(&manager, Arc::new(config), "web.example");

    let default_pem = std::fs::read_to_string(&default_cert).unwrap();
    assert_eq!(
        presented_cert(&client),
        pem::parse(default_pem).unwrap().into_contents()
    );
}

// ============================================================================
// Session Resumption Across Reload
// ============================================================================

#[test]
fn test_session_resumes_across_reload_via_seed_carry_over() {
    ensure_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca();
    let manager = TlsContextManager::new("vip", true, None);

    let (cert, key) = write_issued(&ca, dir.path(), "web", "web.example", &["web.example"]);
    let build_config = || {
        let mut config = TlsContextConfig::new(cert.clone(), key.clone());
        config.is_default = true;
        config
    };
    manager
        .reset(&[build_config()], &cache_options(), None, vip(), None)
        .unwrap();

    // Shared client config keeps the resumption store across connections.
    let config = Arc::new(client_config(&ca));

    let (_, server) = run_handshake(&manager, config.clone(), "web.example");
    assert_eq!(server.handshake_kind(), Some(HandshakeKind::Full));

    // Reload with no seeds given: the new contexts inherit the old ticket
    // keys, so the ticket minted before the reload still decrypts.
    manager
        .reset(&[build_config()], &cache_options(), None, vip(), None)
        .unwrap();

    let (_, server) = run_handshake(&manager, config, "web.example");
    assert_eq!(server.handshake_kind(), Some(HandshakeKind::Resumed));
}

// ============================================================================
// Client Authentication
// ============================================================================

#[test]
fn test_mtls_client_certificate_verified() {
    ensure_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca();
    let manager = TlsContextManager::new("vip", true, None);

    let (cert, key) = write_issued(&ca, dir.path(), "web", "web.example", &["web.example"]);
    let ca_path = dir.path().join("ca.pem");
    std::fs::write(&ca_path, ca.as_ref().pem()).unwrap();

    let mut config = TlsContextConfig::new(cert, key);
    config.is_default = true;
    config.client_ca_file = Some(ca_path);
    config.client_verification = ClientVerification::Required;
    manager
        .reset(&[config], &cache_options(), None, vip(), None)
        .unwrap();

    let (client_cert, client_key) = common::issue_client_cert(&ca, "test-client");
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.as_ref().der().to_vec()))
        .unwrap();
    let client_tls = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            vec![CertificateDer::from(client_cert.der().to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(client_key.serialize_der())),
        )
        .unwrap();

    let (_, server) = run_handshake(&manager, Arc::new(client_tls), "web.example");
    let presented = server.peer_certificates().expect("client certificate");
    assert_eq!(presented[0].as_ref(), client_cert.der().as_ref());
}

// ============================================================================
// Legacy Cipher Policy
// ============================================================================

#[test]
fn test_tls12_client_gets_legacy_cipher_list() {
    ensure_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca();
    let manager = TlsContextManager::new("vip", true, None);

    let (cert, key) = write_issued(&ca, dir.path(), "web", "web.example", &["web.example"]);
    let mut config = TlsContextConfig::new(cert, key);
    config.is_default = true;
    config.legacy_cipher_suites = vec!["TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384".to_string()];
    manager
        .reset(&[config], &cache_options(), None, vip(), None)
        .unwrap();

    // A TLS 1.2-only client must be served from the legacy list.
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.as_ref().der().to_vec()))
        .unwrap();
    let old_client = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_root_certificates(roots)
        .with_no_client_auth();

    let (client, _server) = run_handshake(&manager, Arc::new(old_client), "web.example");
    assert_eq!(
        client.negotiated_cipher_suite().unwrap().suite(),
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
    );

    // A modern client is unaffected by the legacy list.
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.as_ref().der().to_vec()))
        .unwrap();
    let modern_client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let (client, _server) = run_handshake(&manager, Arc::new(modern_client), "web.example");
    assert!(matches!(
        client.negotiated_cipher_suite().unwrap().suite(),
        CipherSuite::TLS13_AES_128_GCM_SHA256
            | CipherSuite::TLS13_AES_256_GCM_SHA384
            | CipherSuite::TLS13_CHACHA20_POLY1305_SHA256
    ));
}
