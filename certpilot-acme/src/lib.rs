//! # certpilot ACME
//!
//! Obtains and renews a TLS certificate from an ACME CA (RFC 8555) and answers
//! the CA's TLS-ALPN-01 challenge (RFC 8737) from the production TLS listener.
//!
//! ## Pieces
//!
//! - [`KeyMaterialProvider`] generates ephemeral ECDSA keys
//! - [`AcmeTransport`] / [`HttpTransport`] talk JWS-signed HTTPS to the CA
//! - [`AcmeOrderStateMachine`] runs account, order, challenge, polling and download
//! - [`ChallengeResponder`] picks the certificate for every TLS handshake
//! - [`RenewalScheduler`] keeps a valid certificate installed
//! - [`SharedCertState`] is the only thing the scheduler and the TLS server share
//!
//! ## Quick Start
//!
//! ```no_run
//! use certpilot_acme::{
//!     AcmeConfig, CancelSignal, ChallengeResponder, HttpTransport, RenewalScheduler,
//!     SharedCertState,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AcmeConfig::lets_encrypt_staging(
//!         vec!["admin@example.com".to_string()],
//!         vec!["example.com".to_string()],
//!     )
//!     .with_accept_tos(true);
//!
//!     let shared = Arc::new(SharedCertState::new());
//!     let responder = Arc::new(ChallengeResponder::new(shared.clone(), vec![b"http/1.1".to_vec()]));
//!     let _tls_config = responder.server_config()?;
//!
//!     let transport = Arc::new(HttpTransport::connect(&config).await?);
//!     let mut scheduler = RenewalScheduler::new(config, transport, shared, CancelSignal::new());
//!     scheduler.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Certificate Providers
//!
//! ```
//! use certpilot_acme::AcmeConfig;
//!
//! let staging = AcmeConfig::lets_encrypt_staging(
//!     vec!["admin@example.com".to_string()],
//!     vec!["example.com".to_string()],
//! );
//! let pebble = AcmeConfig::ca(
//!     "localhost",
//!     14000,
//!     "/dir",
//!     vec!["admin@example.com".to_string()],
//!     vec!["example.com".to_string()],
//! );
//! assert_ne!(staging.directory_url, pebble.directory_url);
//! ```

pub mod account;
pub mod cancel;
pub mod challenge;
pub mod config;
pub mod directory;
pub mod error;
pub mod jws;
pub mod keys;
pub mod machine;
pub mod order;
pub mod responder;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use account::*;
pub use cancel::CancelSignal;
pub use challenge::*;
pub use config::*;
pub use directory::*;
pub use error::*;
pub use keys::{Curve, KEY_DUMP_TARGET, KeyMaterialProvider, KeyPair};
pub use machine::{AcmeOrderStateMachine, OrderState, Phase, PollPolicy, StepResult};
pub use order::*;
pub use responder::{ACME_TLS_ALPN_PROTOCOL, CertificateMaterial, ChallengeResponder};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{RenewalPolicy, RenewalScheduler, SchedulerState};
pub use state::{ActiveCertificate, CertificateChain, SharedCertState};
pub use transport::{AcmeTransport, HttpTransport, OrderHandle};
