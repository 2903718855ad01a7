//! End-to-end tests of the TLS listener and the settings glue.

use certpilot::prelude::*;
use certpilot_acme::{
    ActiveCertificate, CertificateChain, Challenge, ChallengeCertificate, ChallengeStatus, Curve,
    KeyMaterialProvider, TlsAlpn01Challenge, ACME_TLS_ALPN_PROTOCOL,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

const DOMAIN: &str = "example.test";

/// Accepts any server certificate so tests can inspect what was served
#[derive(Debug)]
struct InspectOnly(Arc<CryptoProvider>);

impl ServerCertVerifier for InspectOnly {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

struct Harness {
    addr: SocketAddr,
    shared: Arc<SharedCertState>,
    cancel: CancelSignal,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with_timeout(Duration::from_secs(10)).await
    }

    async fn start_with_timeout(handshake_timeout: Duration) -> Self {
        let shared = Arc::new(SharedCertState::new());
        let responder = Arc::new(ChallengeResponder::new(
            shared.clone(),
            vec![b"http/1.1".to_vec()],
        ));
        let server = TlsServer::bind("127.0.0.1:0", responder, shared.clone())
            .await
            .unwrap()
            .with_handshake_timeout(handshake_timeout);
        let addr = server.local_addr().unwrap();
        let cancel = CancelSignal::new();

        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            server
                .serve(StaticResponse::new("hello from certpilot\n"), serve_cancel)
                .await
                .unwrap();
        });

        Self {
            addr,
            shared,
            cancel,
        }
    }

    async fn connect(&self, alpn: &[u8]) -> std::io::Result<TlsStream<TcpStream>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InspectOnly(provider)))
            .with_no_client_auth();
        config.alpn_protocols = vec![alpn.to_vec()];

        let tcp = TcpStream::connect(self.addr).await?;
        TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from(DOMAIN).unwrap(), tcp)
            .await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn production_certificate() -> ActiveCertificate {
    let key = KeyMaterialProvider::new()
        .generate_key_pair(Curve::P256)
        .unwrap();
    let params = rcgen::CertificateParams::new(vec![DOMAIN.to_string()]).unwrap();
    let pem = params.self_signed(&key.to_rcgen().unwrap()).unwrap().pem();

    ActiveCertificate::new(CertificateChain::parse(&pem).unwrap(), &key).unwrap()
}

fn challenge_certificate() -> ChallengeCertificate {
    let keys = KeyMaterialProvider::new();
    let account_key = keys.generate_key_pair(Curve::P256).unwrap();
    let challenge = Challenge {
        challenge_type: "tls-alpn-01".to_string(),
        url: "https://ca.test/chall/1".to_string(),
        status: ChallengeStatus::Pending,
        token: "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA".to_string(),
        validated: None,
        error: None,
    };
    let tls = TlsAlpn01Challenge::new(DOMAIN, &challenge, &account_key).unwrap();
    ChallengeCertificate::generate(&tls, &keys, Duration::from_secs(600)).unwrap()
}

fn served_leaf(stream: &TlsStream<TcpStream>) -> CertificateDer<'static> {
    stream.get_ref().1.peer_certificates().unwrap()[0].clone().into_owned()
}

async fn get(stream: &mut TlsStream<TcpStream>) -> String {
    stream
        .write_all(b"GET / HTTP/1.1\r\nhost: example.test\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_production_traffic_gets_production_certificate() {
    let harness = Harness::start().await;
    let active = production_certificate();
    let expected = active.chain().certs()[0].clone();
    harness.shared.publish(active);
    harness.shared.publish_challenge(challenge_certificate());

    let mut stream = harness.connect(b"http/1.1").await.unwrap();
    assert_eq!(served_leaf(&stream), expected);
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    let response = get(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello from certpilot\n"));
}

#[tokio::test]
async fn test_validation_handshake_gets_challenge_certificate() {
    let harness = Harness::start().await;
    harness.shared.publish(production_certificate());
    let challenge = challenge_certificate();
    let expected = challenge.certified_key().cert[0].clone();
    harness.shared.publish_challenge(challenge);

    let mut stream = harness.connect(ACME_TLS_ALPN_PROTOCOL).await.unwrap();
    assert_eq!(served_leaf(&stream), expected);
    assert_eq!(
        stream.get_ref().1.alpn_protocol(),
        Some(ACME_TLS_ALPN_PROTOCOL)
    );

    // The listener closes validation connections without application data
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_validation_without_challenge_falls_back_to_production() {
    let harness = Harness::start().await;
    let active = production_certificate();
    let expected = active.chain().certs()[0].clone();
    harness.shared.publish(active);

    let stream = harness.connect(ACME_TLS_ALPN_PROTOCOL).await.unwrap();
    assert_eq!(served_leaf(&stream), expected);
}

#[tokio::test]
async fn test_handshake_fails_without_certificate() {
    let harness = Harness::start().await;
    assert!(harness.connect(b"http/1.1").await.is_err());

    // The listener keeps accepting once a certificate is published
    harness.shared.publish(production_certificate());
    assert!(harness.connect(b"http/1.1").await.is_ok());
}

#[tokio::test]
async fn test_production_handshake_discards_superseded_certificate() {
    let harness = Harness::start().await;
    harness.shared.publish(production_certificate());
    let renewed = production_certificate();
    let expected = renewed.chain().certs()[0].clone();
    harness.shared.publish(renewed);
    assert!(harness.shared.has_superseded());

    let mut stream = harness.connect(b"http/1.1").await.unwrap();
    assert_eq!(served_leaf(&stream), expected);
    get(&mut stream).await;

    assert!(!harness.shared.has_superseded());
}

#[tokio::test]
async fn test_unrelated_alpn_gets_production_certificate() {
    let harness = Harness::start().await;
    let active = production_certificate();
    let expected = active.chain().certs()[0].clone();
    harness.shared.publish(active);
    harness.shared.publish_challenge(challenge_certificate());

    let mut stream = harness.connect(b"spdy/3").await.unwrap();
    assert_eq!(served_leaf(&stream), expected);
    assert_eq!(stream.get_ref().1.alpn_protocol(), None);

    let response = get(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_handshake_timeout() {
    let harness = Harness::start_with_timeout(Duration::from_millis(200)).await;
    harness.shared.publish(production_certificate());

    let mut tcp = TcpStream::connect(harness.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), tcp.read(&mut buf))
        .await
        .expect("listener kept a silent connection open");

    // Closed or reset, never answered
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_oversized_request_line_is_rejected() {
    let harness = Harness::start().await;
    harness.shared.publish(production_certificate());

    let mut stream = harness.connect(b"http/1.1").await.unwrap();
    let _ = stream.write_all(&vec![b'a'; 16 * 1024]).await;
    let _ = stream.flush().await;

    let mut response = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    assert!(finished.is_ok(), "listener kept reading an unbounded line");
    assert!(!String::from_utf8_lossy(&response).contains("200 OK"));
}

#[test]
fn test_settings_become_acme_config() {
    let manager = ConfigManager::new();
    manager
        .load_str(
            r#"
            ca_host = "localhost"
            ca_port = 14000
            directory_path = "/dir"
            domains = ["example.test"]
            contacts = ["admin@example.test"]
            accept_tos = true
            key_curve = "p384"
            poll_attempts = 12
            order_retry_secs = 3600
            "#,
            certpilot_config::FileFormat::Toml,
        )
        .unwrap();
    let settings: Settings = manager.load_validated().unwrap();

    let config = acme_config(&settings).unwrap();
    assert_eq!(config.directory_url, "https://localhost:14000/dir");
    assert_eq!(config.key_curve, Curve::P384);
    assert_eq!(config.poll_attempts, 12);
    assert_eq!(config.order_retry_delay, Duration::from_secs(3600));
    assert_eq!(config.renewal_interval, Duration::from_secs(30 * 24 * 60 * 60));
}

#[test]
fn test_settings_without_directory_rejected() {
    let settings = Settings {
        domains: vec!["example.test".to_string()],
        contacts: vec!["admin@example.test".to_string()],
        ..Settings::default()
    };
    assert!(acme_config(&settings).is_err());
}

#[test]
fn test_example_configuration_is_valid() {
    let manager = ConfigManager::new();
    manager
        .load_str(
            include_str!("../certpilot.example.toml"),
            certpilot_config::FileFormat::Toml,
        )
        .unwrap();
    let settings: Settings = manager.load_validated().unwrap();

    assert!(acme_config(&settings).is_ok());
}
