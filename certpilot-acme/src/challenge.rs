/// ACME challenge types and handling
use crate::config::ChallengeType;
use crate::error::{AcmeError, Result};
use crate::keys::{Curve, KeyMaterialProvider, KeyPair};
use crate::order::{Identifier, Problem};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// ACME authorization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    /// Authorization identifier
    pub identifier: Identifier,

    /// Authorization status
    pub status: AuthorizationStatus,

    /// Expiration timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    /// List of challenges
    pub challenges: Vec<Challenge>,

    /// Wildcard indicator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<bool>,
}

impl Authorization {
    /// First offered challenge of the given type
    pub fn find_challenge(&self, challenge_type: ChallengeType) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == challenge_type.as_str())
    }

    /// Problem attached to the first failed challenge, if any
    pub fn problem(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}

/// Authorization status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizationStatus {
    /// Authorization is pending
    Pending,
    /// Authorization is valid
    Valid,
    /// Authorization is invalid
    Invalid,
    /// Authorization is deactivated
    Deactivated,
    /// Authorization has expired
    Expired,
    /// Authorization is revoked
    Revoked,
}

/// ACME challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    /// Challenge type
    #[serde(rename = "type")]
    pub challenge_type: String,

    /// Challenge URL
    pub url: String,

    /// Challenge status
    pub status: ChallengeStatus,

    /// Challenge token
    #[serde(default)]
    pub token: String,

    /// Validation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,

    /// Error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// Challenge status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChallengeStatus {
    /// Challenge is pending
    Pending,
    /// Challenge is processing
    Processing,
    /// Challenge is valid
    Valid,
    /// Challenge is invalid
    Invalid,
}

/// TLS-ALPN-01 challenge data
#[derive(Debug, Clone)]
pub struct TlsAlpn01Challenge {
    /// Domain being validated
    pub domain: String,

    /// Challenge token
    pub token: String,

    /// Key authorization (`token.thumbprint`)
    pub key_authorization: String,

    /// Challenge URL
    pub url: String,
}

impl TlsAlpn01Challenge {
    /// Derive the key authorization for `challenge` under `account_key`
    pub fn new(domain: impl Into<String>, challenge: &Challenge, account_key: &KeyPair) -> Result<Self> {
        if challenge.token.is_empty() {
            return Err(AcmeError::InvalidResponse(
                "tls-alpn-01 challenge without a token".to_string(),
            ));
        }
        Ok(Self {
            domain: domain.into(),
            token: challenge.token.clone(),
            key_authorization: format!("{}.{}", challenge.token, account_key.jwk_thumbprint()),
            url: challenge.url.clone(),
        })
    }

    /// SHA-256 of the key authorization, the `acmeIdentifier` payload
    pub fn digest(&self) -> Vec<u8> {
        ring::digest::digest(&ring::digest::SHA256, self.key_authorization.as_bytes())
            .as_ref()
            .to_vec()
    }
}

/// Self-signed certificate answering one TLS-ALPN-01 validation
#[derive(Clone)]
pub struct ChallengeCertificate {
    domain: String,
    certified_key: Arc<CertifiedKey>,
    created_at: Instant,
    ttl: Duration,
}

impl ChallengeCertificate {
    /// Build the validation certificate for `challenge` with a throwaway key.
    ///
    /// The only SAN is the domain under validation and the certificate carries
    /// the critical `acmeIdentifier` extension.
    pub fn generate(
        challenge: &TlsAlpn01Challenge,
        keys: &KeyMaterialProvider,
        ttl: Duration,
    ) -> Result<Self> {
        let throwaway = keys.generate_key_pair(Curve::P256)?;
        let signing_key = throwaway.to_rcgen()?;

        let mut params = CertificateParams::new(vec![challenge.domain.clone()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .custom_extensions
            .push(CustomExtension::new_acme_identifier(&challenge.digest()));
        let cert = params.self_signed(&signing_key)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(throwaway.pkcs8_der().to_vec()));
        let signer = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| AcmeError::CertificateError(e.to_string()))?;

        Ok(Self {
            domain: challenge.domain.to_ascii_lowercase(),
            certified_key: Arc::new(CertifiedKey::new(vec![cert.der().clone()], signer)),
            created_at: Instant::now(),
            ttl,
        })
    }

    /// Domain this certificate validates, lowercased
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    /// Whether the TTL has elapsed
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

impl fmt::Debug for ChallengeCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeCertificate")
            .field("domain", &self.domain)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
