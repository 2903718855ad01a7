//! TLS-ALPN-01 challenge responder
//!
//! Hooks certificate selection of the production TLS listener. A handshake
//! that negotiates exactly `acme-tls/1` for a domain under validation gets the
//! challenge certificate; every other handshake gets the production
//! certificate.

use crate::error::{AcmeError, Result};
use crate::state::SharedCertState;
use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;

/// ALPN protocol identifier for TLS-ALPN-01 validation (RFC 8737)
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// Certificate chosen for one handshake
#[derive(Clone)]
pub enum CertificateMaterial {
    /// Validation certificate, only for `acme-tls/1`
    Challenge(Arc<CertifiedKey>),
    /// Normal production certificate
    Production(Arc<CertifiedKey>),
}

impl CertificateMaterial {
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        match self {
            CertificateMaterial::Challenge(key) | CertificateMaterial::Production(key) => {
                key.clone()
            }
        }
    }

    pub fn is_challenge(&self) -> bool {
        matches!(self, CertificateMaterial::Challenge(_))
    }
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateMaterial::Challenge(_) => f.write_str("CertificateMaterial::Challenge"),
            CertificateMaterial::Production(_) => f.write_str("CertificateMaterial::Production"),
        }
    }
}

/// Certificate resolver for the production listener
pub struct ChallengeResponder {
    state: Arc<SharedCertState>,
    protocols: Vec<Vec<u8>>,
}

impl ChallengeResponder {
    /// Create a responder with the server's production ALPN protocols, most
    /// preferred first. `acme-tls/1` is always offered last.
    pub fn new(state: Arc<SharedCertState>, production_protocols: Vec<Vec<u8>>) -> Self {
        let mut protocols: Vec<Vec<u8>> = production_protocols
            .into_iter()
            .filter(|p| p.as_slice() != ACME_TLS_ALPN_PROTOCOL)
            .collect();
        protocols.push(ACME_TLS_ALPN_PROTOCOL.to_vec());
        Self { state, protocols }
    }

    /// Server ALPN preference list
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.protocols
    }

    /// Protocol the server will select for a client offering `offered`
    pub fn negotiate(&self, offered: &[&[u8]]) -> Option<&[u8]> {
        self.protocols
            .iter()
            .map(Vec::as_slice)
            .find(|ours| offered.contains(ours))
    }

    /// Pick the certificate for a handshake.
    ///
    /// The challenge certificate is returned only when `selected_protocol` is
    /// exactly `acme-tls/1` and a live certificate exists for `server_name`.
    pub fn select_certificate(
        &self,
        selected_protocol: Option<&[u8]>,
        server_name: Option<&str>,
    ) -> Result<CertificateMaterial> {
        if Self::is_validation_connection(selected_protocol)
            && let Some(name) = server_name
            && let Some(key) = self.state.challenge_for(name)
        {
            tracing::debug!(server_name = name, "Serving challenge certificate");
            return Ok(CertificateMaterial::Challenge(key));
        }

        self.state
            .production_key()
            .map(CertificateMaterial::Production)
            .ok_or(AcmeError::CertificateUnavailable)
    }

    /// Whether the negotiated protocol marks a validation connection, which
    /// must be closed right after the handshake
    pub fn is_validation_connection(alpn: Option<&[u8]>) -> bool {
        alpn == Some(ACME_TLS_ALPN_PROTOCOL)
    }

    /// rustls server configuration using this responder as certificate resolver
    pub fn server_config(self: Arc<Self>) -> Result<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let protocols = self.protocols.clone();

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| AcmeError::Internal(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(self);
        config.alpn_protocols = protocols;
        Ok(config)
    }
}

impl ResolvesServerCert for ChallengeResponder {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        let offered: Vec<&[u8]> = client_hello
            .alpn()
            .map(|protocols| protocols.collect())
            .unwrap_or_default();
        let selected = self.negotiate(&offered);

        match self.select_certificate(selected, server_name) {
            Ok(material) => Some(material.certified_key()),
            Err(err) => {
                tracing::warn!(
                    server_name = server_name.unwrap_or("<none>"),
                    error = %err,
                    "Aborting handshake"
                );
                None
            }
        }
    }
}

impl fmt::Debug for ChallengeResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocols: Vec<String> = self
            .protocols
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        f.debug_struct("ChallengeResponder")
            .field("protocols", &protocols)
            .field("state", &self.state)
            .finish()
    }
}
