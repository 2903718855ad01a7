//! Certificate state shared between the renewal workflow and the TLS server
//!
//! The scheduler is the only writer. Handshakes read concurrently: the active
//! certificate is swapped atomically and challenge certificates live in a
//! concurrent map keyed by lowercased domain.

use crate::challenge::ChallengeCertificate;
use crate::error::{AcmeError, Result};
use crate::keys::KeyPair;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;

/// Certificates parsed from a downloaded PEM chain, leaf first
#[derive(Debug, Clone)]
pub struct CertificateChain {
    pem: String,
    certs: Vec<CertificateDer<'static>>,
}

impl CertificateChain {
    /// Parse PEM text; the chain must hold at least one certificate
    pub fn parse(pem: &str) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AcmeError::CertificateError(format!("Failed to parse chain: {}", e)))?;

        if certs.is_empty() {
            return Err(AcmeError::CertificateError(
                "Chain contains no certificates".to_string(),
            ));
        }

        Ok(Self {
            pem: pem.to_string(),
            certs,
        })
    }

    /// The chain as downloaded
    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

/// The production certificate served to normal traffic
pub struct ActiveCertificate {
    chain: CertificateChain,
    certified_key: Arc<CertifiedKey>,
    issued_at: DateTime<Utc>,
}

impl ActiveCertificate {
    /// Pair a chain with the order key it was issued for
    pub fn new(chain: CertificateChain, key: &KeyPair) -> Result<Self> {
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.pkcs8_der().to_vec()));
        let signer = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| AcmeError::CertificateError(e.to_string()))?;
        let certified_key = CertifiedKey::new(chain.certs().to_vec(), signer);

        Ok(Self {
            chain,
            certified_key: Arc::new(certified_key),
            issued_at: Utc::now(),
        })
    }

    pub fn chain(&self) -> &CertificateChain {
        &self.chain
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl fmt::Debug for ActiveCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCertificate")
            .field("certificates", &self.chain.len())
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// Active certificate plus challenge table, shared through an `Arc`
#[derive(Default)]
pub struct SharedCertState {
    active: ArcSwapOption<ActiveCertificate>,
    superseded: ArcSwapOption<ActiveCertificate>,
    challenges: DashMap<String, ChallengeCertificate>,
}

impl SharedCertState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active certificate.
    ///
    /// The previous one is kept until the TLS server confirms the swap via
    /// [`load_production_certificate`](Self::load_production_certificate).
    pub fn publish(&self, certificate: ActiveCertificate) {
        let previous = self.active.swap(Some(Arc::new(certificate)));
        if previous.is_some() {
            self.superseded.store(previous);
        }
        tracing::info!("Published new active certificate");
    }

    /// Current active certificate, if any
    pub fn active(&self) -> Option<Arc<ActiveCertificate>> {
        self.active.load_full()
    }

    /// Signing material of the active certificate
    pub fn production_key(&self) -> Option<Arc<CertifiedKey>> {
        self.active.load_full().map(|active| active.certified_key())
    }

    /// Entry point for the TLS server to (re)load the production certificate.
    ///
    /// Loading confirms that any superseded certificate is no longer needed.
    pub fn load_production_certificate(&self) -> Result<Arc<CertifiedKey>> {
        let key = self
            .production_key()
            .ok_or(AcmeError::CertificateUnavailable)?;
        if self.superseded.swap(None).is_some() {
            tracing::debug!("Discarded superseded certificate");
        }
        Ok(key)
    }

    /// Whether a superseded certificate is still retained
    pub fn has_superseded(&self) -> bool {
        self.superseded.load().is_some()
    }

    /// Make a challenge certificate available to validation handshakes
    pub fn publish_challenge(&self, certificate: ChallengeCertificate) {
        tracing::debug!(domain = %certificate.domain(), "Publishing challenge certificate");
        self.challenges
            .insert(certificate.domain().to_string(), certificate);
    }

    /// Live challenge certificate for `server_name`; expired entries are never returned
    pub fn challenge_for(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let entry = self.challenges.get(&server_name.to_ascii_lowercase())?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.certified_key())
    }

    /// Remove the challenge certificate for `domain`
    pub fn withdraw_challenge(&self, domain: &str) {
        if self
            .challenges
            .remove(&domain.to_ascii_lowercase())
            .is_some()
        {
            tracing::debug!(domain, "Withdrew challenge certificate");
        }
    }

    /// Drop challenge certificates whose TTL elapsed; returns how many were removed
    pub fn purge_expired_challenges(&self) -> usize {
        let before = self.challenges.len();
        self.challenges.retain(|_, cert| !cert.is_expired());
        let removed = before.saturating_sub(self.challenges.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired challenge certificates");
        }
        removed
    }

    pub fn challenge_count(&self) -> usize {
        self.challenges.len()
    }
}

impl fmt::Debug for SharedCertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCertState")
            .field("active", &self.active.load().is_some())
            .field("superseded", &self.superseded.load().is_some())
            .field("challenges", &self.challenges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{Challenge, ChallengeStatus, TlsAlpn01Challenge};
    use crate::keys::{Curve, KeyMaterialProvider};
    use std::time::Duration;

    fn self_signed_chain(key: &KeyPair, domain: &str) -> String {
        let params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.self_signed(&key.to_rcgen().unwrap()).unwrap().pem()
    }

    fn challenge_cert(keys: &KeyMaterialProvider, domain: &str, ttl: Duration) -> ChallengeCertificate {
        let account = keys.generate_key_pair(Curve::P256).unwrap();
        let challenge = Challenge {
            challenge_type: "tls-alpn-01".to_string(),
            url: "https://ca.test/chall/1".to_string(),
            status: ChallengeStatus::Pending,
            token: "token".to_string(),
            validated: None,
            error: None,
        };
        let tls = TlsAlpn01Challenge::new(domain, &challenge, &account).unwrap();
        ChallengeCertificate::generate(&tls, keys, ttl).unwrap()
    }

    #[test]
    fn test_chain_parsing() {
        let key = KeyMaterialProvider::new()
            .generate_key_pair(Curve::P256)
            .unwrap();
        let pem = self_signed_chain(&key, "example.test");

        let chain = CertificateChain::parse(&pem).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.pem(), pem);

        assert!(CertificateChain::parse("not a certificate").is_err());
    }

    #[test]
    fn test_superseded_kept_until_loaded() {
        let keys = KeyMaterialProvider::new();
        let state = SharedCertState::new();
        assert!(matches!(
            state.load_production_certificate(),
            Err(AcmeError::CertificateUnavailable)
        ));

        for _ in 0..2 {
            let key = keys.generate_key_pair(Curve::P256).unwrap();
            let chain = CertificateChain::parse(&self_signed_chain(&key, "example.test")).unwrap();
            state.publish(ActiveCertificate::new(chain, &key).unwrap());
        }
        assert!(state.has_superseded());

        state.load_production_certificate().unwrap();
        assert!(!state.has_superseded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_lookup_is_case_insensitive() {
        let keys = KeyMaterialProvider::new();
        let state = SharedCertState::new();
        state.publish_challenge(challenge_cert(&keys, "example.test", Duration::from_secs(600)));

        assert!(state.challenge_for("EXAMPLE.test").is_some());
        assert!(state.challenge_for("other.test").is_none());

        state.withdraw_challenge("Example.Test");
        assert_eq!(state.challenge_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_challenge_never_served() {
        let keys = KeyMaterialProvider::new();
        let state = SharedCertState::new();
        state.publish_challenge(challenge_cert(&keys, "example.test", Duration::from_secs(600)));

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(state.challenge_for("example.test").is_none());
        assert_eq!(state.challenge_count(), 1);

        assert_eq!(state.purge_expired_challenges(), 1);
        assert_eq!(state.challenge_count(), 0);
    }
}
