/// ACME client configuration
use crate::error::{AcmeError, Result};
use crate::keys::Curve;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// ACME directory URLs for common providers
pub mod directories {
    /// Let's Encrypt production directory
    pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

    /// Let's Encrypt staging directory (for testing)
    pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

    /// Pebble test CA, as started by its docker-compose file
    pub const PEBBLE: &str = "https://localhost:14000/dir";
}

/// Challenge types supported for domain validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    /// TLS-ALPN-01 challenge (port 443)
    TlsAlpn01,
}

impl ChallengeType {
    /// Wire name used in authorization objects
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl FromStr for ChallengeType {
    type Err = AcmeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tls-alpn-01" | "tls_alpn_01" | "tlsalpn01" => Ok(ChallengeType::TlsAlpn01),
            other => Err(AcmeError::InvalidConfig(format!(
                "Unsupported challenge type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ACME client configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// ACME directory URL
    pub directory_url: String,

    /// Contact addresses for account registration
    pub contact_email: Vec<String>,

    /// Domains to obtain certificates for
    pub domains: Vec<String>,

    /// Challenge type used for every domain
    pub challenge_type: ChallengeType,

    /// Curve for account and order keys
    pub key_curve: Curve,

    /// Accept terms of service automatically
    pub accept_tos: bool,

    /// Delay between order status polls
    pub poll_interval: Duration,

    /// Number of order status polls before giving up
    pub poll_attempts: u32,

    /// Delay before retrying a failed account registration
    pub account_retry_delay: Duration,

    /// Delay before retrying a failed order
    pub order_retry_delay: Duration,

    /// Time between successful orders
    pub renewal_interval: Duration,

    /// Lifetime of a challenge certificate
    pub challenge_ttl: Duration,

    /// Capacity of the buffer the certificate chain is downloaded into
    pub chain_buffer_capacity: usize,

    /// Extra trusted root for the CA's HTTPS endpoint (PEM)
    pub ca_root_cert: Option<PathBuf>,

    /// Dump generated keys to the debug sink (debug builds only)
    pub debug_key_dump: bool,
}

impl AcmeConfig {
    /// Create a new ACME configuration
    ///
    /// # Example
    ///
    /// ```
    /// use certpilot_acme::{AcmeConfig, ChallengeType};
    ///
    /// let config = AcmeConfig::new(
    ///     "https://acme-v02.api.letsencrypt.org/directory",
    ///     vec!["admin@example.com".to_string()],
    ///     vec!["example.com".to_string(), "www.example.com".to_string()],
    /// );
    /// assert_eq!(config.challenge_type, ChallengeType::TlsAlpn01);
    /// ```
    pub fn new(
        directory_url: impl Into<String>,
        contact_email: Vec<String>,
        domains: Vec<String>,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact_email,
            domains,
            challenge_type: ChallengeType::TlsAlpn01,
            key_curve: Curve::P256,
            accept_tos: false,
            poll_interval: Duration::from_secs(2),
            poll_attempts: 30,
            account_retry_delay: Duration::from_secs(10),
            order_retry_delay: Duration::from_secs(24 * 60 * 60),
            renewal_interval: Duration::from_secs(30 * 24 * 60 * 60),
            challenge_ttl: Duration::from_secs(10 * 60),
            chain_buffer_capacity: 16 * 1024,
            ca_root_cert: None,
            debug_key_dump: false,
        }
    }

    /// Create configuration for a CA given as host, port and directory path
    ///
    /// # Example
    ///
    /// ```
    /// use certpilot_acme::AcmeConfig;
    ///
    /// let config = AcmeConfig::ca(
    ///     "localhost",
    ///     14000,
    ///     "/dir",
    ///     vec!["admin@example.com".to_string()],
    ///     vec!["example.com".to_string()],
    /// );
    /// assert_eq!(config.directory_url, "https://localhost:14000/dir");
    /// ```
    pub fn ca(
        host: &str,
        port: u16,
        path: &str,
        contact_email: Vec<String>,
        domains: Vec<String>,
    ) -> Self {
        let path = path.trim_start_matches('/');
        let url = if port == 443 {
            format!("https://{}/{}", host, path)
        } else {
            format!("https://{}:{}/{}", host, port, path)
        };
        Self::new(url, contact_email, domains)
    }

    /// Create configuration for Let's Encrypt production
    pub fn lets_encrypt_production(contact_email: Vec<String>, domains: Vec<String>) -> Self {
        Self::new(directories::LETS_ENCRYPT_PRODUCTION, contact_email, domains)
    }

    /// Create configuration for Let's Encrypt staging (testing)
    pub fn lets_encrypt_staging(contact_email: Vec<String>, domains: Vec<String>) -> Self {
        Self::new(directories::LETS_ENCRYPT_STAGING, contact_email, domains)
    }

    /// Set the challenge type
    pub fn with_challenge_type(mut self, challenge_type: ChallengeType) -> Self {
        self.challenge_type = challenge_type;
        self
    }

    /// Set the key curve
    pub fn with_key_curve(mut self, curve: Curve) -> Self {
        self.key_curve = curve;
        self
    }

    /// Accept terms of service automatically
    pub fn with_accept_tos(mut self, accept: bool) -> Self {
        self.accept_tos = accept;
        self
    }

    /// Set order polling interval and attempt bound
    pub fn with_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts;
        self
    }

    /// Set the account retry delay
    pub fn with_account_retry_delay(mut self, delay: Duration) -> Self {
        self.account_retry_delay = delay;
        self
    }

    /// Set the order retry delay
    pub fn with_order_retry_delay(mut self, delay: Duration) -> Self {
        self.order_retry_delay = delay;
        self
    }

    /// Set the renewal interval
    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    /// Set the challenge certificate lifetime
    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    /// Set the chain download buffer capacity
    pub fn with_chain_buffer_capacity(mut self, capacity: usize) -> Self {
        self.chain_buffer_capacity = capacity;
        self
    }

    /// Trust an extra root certificate for the CA endpoint
    pub fn with_ca_root_cert(mut self, path: PathBuf) -> Self {
        self.ca_root_cert = Some(path);
        self
    }

    /// Enable the debug key dump
    pub fn with_debug_key_dump(mut self, enable: bool) -> Self {
        self.debug_key_dump = enable;
        self
    }

    /// Check the parts of the configuration the workflow depends on
    pub fn validate(&self) -> Result<()> {
        if self.directory_url.is_empty() {
            return Err(AcmeError::InvalidConfig(
                "Directory URL cannot be empty".to_string(),
            ));
        }
        if self.domains.is_empty() {
            return Err(AcmeError::InvalidConfig(
                "At least one domain is required".to_string(),
            ));
        }
        if self.contact_email.is_empty() {
            return Err(AcmeError::InvalidConfig(
                "At least one contact is required".to_string(),
            ));
        }
        if self.poll_attempts == 0 {
            return Err(AcmeError::InvalidConfig(
                "Poll attempts must be at least 1".to_string(),
            ));
        }
        if self.chain_buffer_capacity == 0 {
            return Err(AcmeError::InvalidConfig(
                "Chain buffer capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self::lets_encrypt_staging(
            vec!["admin@example.com".to_string()],
            vec!["example.com".to_string()],
        )
    }
}
