/// Error types for ACME operations
use thiserror::Error;

use crate::machine::Phase;

/// Problem type the CA uses to reject a stale anti-replay nonce.
pub const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// Problem type the CA uses when the account URL is unknown.
pub const ACCOUNT_DOES_NOT_EXIST: &str = "urn:ietf:params:acme:error:accountDoesNotExist";

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("Entropy source unavailable")]
    EntropyUnavailable,

    #[error("Unsupported curve: {0}")]
    UnsupportedCurve(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("CA unreachable: {0}")]
    Unreachable(String),

    #[error("TLS handshake with CA failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Request rejected by CA ({status}): {detail}")]
    RequestRejected {
        status: u16,
        problem_type: Option<String>,
        detail: String,
    },

    #[error("Account already exists at {account_url}")]
    AccountAlreadyExists { account_url: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid directory: {0}")]
    InvalidDirectory(String),

    #[error("Invalid response from CA: {0}")]
    InvalidResponse(String),

    #[error("No usable challenge offered: {0}")]
    ChallengeUnavailable(String),

    #[error("Operation not allowed in state {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Validation did not finish after {attempts} polls")]
    ValidationTimeout { attempts: u32 },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Certificate not ready yet")]
    NotReady,

    #[error("No certificate available for this handshake")]
    CertificateUnavailable,

    #[error("Certificate generation failed: {0}")]
    CertificateError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the scheduler and by log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or TLS failure reaching the CA.
    Transport,
    /// The CA rejected a request or answered with something unusable.
    Protocol,
    /// Polling ran out of attempts without a terminal status.
    ValidationTimeout,
    /// The CA reported the order or an authorization invalid.
    ValidationFailed,
    /// A caller buffer was too small.
    ResourceExhaustion,
    /// Key generation failed.
    KeyMaterial,
    /// Certificate material could not be built or is missing.
    Certificate,
    /// Static configuration is unusable.
    Config,
    /// A cancellation signal interrupted the operation.
    Cancelled,
}

impl AcmeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcmeError::Unreachable(_)
            | AcmeError::TlsHandshakeFailed(_)
            | AcmeError::HttpError(_) => ErrorKind::Transport,
            AcmeError::RequestRejected { .. }
            | AcmeError::AccountAlreadyExists { .. }
            | AcmeError::JsonError(_)
            | AcmeError::InvalidDirectory(_)
            | AcmeError::InvalidResponse(_)
            | AcmeError::ChallengeUnavailable(_)
            | AcmeError::InvalidState { .. }
            | AcmeError::Internal(_) => ErrorKind::Protocol,
            AcmeError::ValidationTimeout { .. } => ErrorKind::ValidationTimeout,
            AcmeError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            AcmeError::BufferTooSmall { .. } | AcmeError::EncodingError(_) => {
                ErrorKind::ResourceExhaustion
            }
            AcmeError::EntropyUnavailable | AcmeError::UnsupportedCurve(_) => {
                ErrorKind::KeyMaterial
            }
            AcmeError::NotReady
            | AcmeError::CertificateUnavailable
            | AcmeError::CertificateError(_) => ErrorKind::Certificate,
            AcmeError::InvalidConfig(_) => ErrorKind::Config,
            AcmeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the CA rejected a request with the given problem type.
    pub fn is_problem(&self, problem: &str) -> bool {
        matches!(
            self,
            AcmeError::RequestRejected { problem_type: Some(t), .. } if t == problem
        )
    }

    /// Whether the CA no longer knows the account that signed the request.
    pub fn is_unknown_account(&self) -> bool {
        self.is_problem(ACCOUNT_DOES_NOT_EXIST)
    }
}

impl From<rcgen::Error> for AcmeError {
    fn from(err: rcgen::Error) -> Self {
        AcmeError::CertificateError(err.to_string())
    }
}

/// An order attempt failure annotated with the phase it happened in.
#[derive(Error, Debug)]
#[error("{phase} phase failed: {source}")]
pub struct PhaseError {
    pub phase: Phase,
    #[source]
    pub source: AcmeError,
}

impl PhaseError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

pub type Result<T> = std::result::Result<T, AcmeError>;
