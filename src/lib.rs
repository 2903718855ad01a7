//! # certpilot
//!
//! Keeps a TLS listener supplied with a certificate from an ACME CA and
//! answers the CA's TLS-ALPN-01 challenges on that same listener.
//!
//! The heavy lifting lives in two member crates, re-exported here:
//!
//! - [`certpilot_acme`]: keys, CA transport, order state machine, challenge
//!   responder and renewal scheduler
//! - [`certpilot_config`]: layered file and environment configuration
//!
//! This crate adds log setup, the demo TLS listener and the glue that turns
//! [`Settings`] into an [`AcmeConfig`].

pub mod error;
pub mod logging;
pub mod server;

pub use certpilot_acme;
pub use certpilot_config;
pub use error::{Error, Result};

use certpilot_acme::{AcmeConfig, AcmeError, ChallengeType, Curve};
use certpilot_config::Settings;

/// Build the ACME client configuration from validated settings
pub fn acme_config(settings: &Settings) -> Result<AcmeConfig> {
    let directory_url = settings.resolved_directory_url().ok_or_else(|| {
        AcmeError::InvalidConfig("No ACME directory configured".to_string())
    })?;
    let challenge_type: ChallengeType = settings.challenge_type.parse()?;
    let curve: Curve = settings.key_curve.parse()?;

    let mut config = AcmeConfig::new(
        directory_url,
        settings.contacts.clone(),
        settings.domains.clone(),
    )
    .with_challenge_type(challenge_type)
    .with_key_curve(curve)
    .with_accept_tos(settings.accept_tos)
    .with_polling(settings.poll_interval(), settings.poll_attempts)
    .with_account_retry_delay(settings.account_retry_delay())
    .with_order_retry_delay(settings.order_retry_delay())
    .with_renewal_interval(settings.renewal_interval())
    .with_challenge_ttl(settings.challenge_ttl())
    .with_chain_buffer_capacity(settings.chain_buffer_bytes)
    .with_debug_key_dump(settings.debug_key_dump);

    if let Some(root) = &settings.ca_root_cert {
        config = config.with_ca_root_cert(root.clone());
    }

    config.validate()?;
    Ok(config)
}

pub mod prelude {
    pub use crate::acme_config;
    pub use crate::logging::{LogConfig, LogFormat, LogLevel, LogOutput};
    pub use crate::server::{ConnectionHandler, StaticResponse, TlsServer};
    pub use certpilot_acme::{
        AcmeConfig, CancelSignal, ChallengeResponder, HttpTransport, RenewalScheduler,
        SharedCertState,
    };
    pub use certpilot_config::{ConfigManager, Settings};
}
