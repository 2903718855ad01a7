//! Errors surfaced by the certpilot binary and its TLS listener

use certpilot_acme::AcmeError;
use certpilot_config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
