//! certpilot runtime settings

use crate::validation::{ConfigValidator, Validate};
use crate::{ConfigError, ConfigManager, ENV_PREFIX, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CHALLENGE_TYPES: &[&str] = &["tls-alpn-01"];
const KEY_CURVES: &[&str] = &[
    "p256",
    "p-256",
    "secp256r1",
    "prime256v1",
    "p384",
    "p-384",
    "secp384r1",
];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["json", "plain", "pretty", "compact"];

/// Everything the certpilot binary can be configured with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Full ACME directory URL; takes precedence over `ca_host`
    pub directory_url: Option<String>,
    pub ca_host: Option<String>,
    pub ca_port: u16,
    pub directory_path: String,

    #[serde(deserialize_with = "string_list")]
    pub contacts: Vec<String>,
    #[serde(deserialize_with = "string_list")]
    pub domains: Vec<String>,

    pub challenge_type: String,
    pub key_curve: String,
    pub accept_tos: bool,

    /// Address of the TLS listener that answers both traffic and challenges
    pub listen_addr: String,

    pub poll_interval_secs: u64,
    pub poll_attempts: u32,
    pub account_retry_secs: u64,
    pub order_retry_secs: u64,
    pub renewal_interval_secs: u64,
    pub challenge_ttl_secs: u64,
    pub chain_buffer_bytes: usize,

    /// Extra root to trust for the CA (a local Pebble instance, for example)
    pub ca_root_cert: Option<PathBuf>,
    pub debug_key_dump: bool,

    pub log_level: String,
    pub log_format: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directory_url: None,
            ca_host: None,
            ca_port: 443,
            directory_path: "/directory".to_string(),
            contacts: Vec::new(),
            domains: Vec::new(),
            challenge_type: "tls-alpn-01".to_string(),
            key_curve: "p256".to_string(),
            accept_tos: false,
            listen_addr: "0.0.0.0:443".to_string(),
            poll_interval_secs: 2,
            poll_attempts: 30,
            account_retry_secs: 10,
            order_retry_secs: 24 * 60 * 60,
            renewal_interval_secs: 30 * 24 * 60 * 60,
            challenge_ttl_secs: 10 * 60,
            chain_buffer_bytes: 16 * 1024,
            ca_root_cert: None,
            debug_key_dump: false,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl Settings {
    /// Load from an optional file, `.env` and `CERTPILOT_*` variables
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let manager = ConfigManager::with_prefix(ENV_PREFIX);
        if let Some(path) = file {
            manager.load_file(path)?;
        }
        manager.load_dotenv(None)?;
        manager.load_validated()
    }

    /// The directory URL, built from host, port and path when not given whole
    pub fn resolved_directory_url(&self) -> Option<String> {
        if let Some(url) = &self.directory_url {
            return Some(url.clone());
        }
        let host = self.ca_host.as_deref()?;
        let path = self.directory_path.trim_start_matches('/');
        Some(match self.ca_port {
            443 => format!("https://{}/{}", host, path),
            port => format!("https://{}:{}/{}", host, port, path),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn account_retry_delay(&self) -> Duration {
        Duration::from_secs(self.account_retry_secs)
    }

    pub fn order_retry_delay(&self) -> Duration {
        Duration::from_secs(self.order_retry_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }
}

impl Validate for Settings {
    fn validate(&self) -> Result<()> {
        match (&self.directory_url, &self.ca_host) {
            (Some(url), _) => ConfigValidator::is_url(url, "directory_url")?,
            (None, Some(host)) => {
                ConfigValidator::not_empty(host, "ca_host")?;
                ConfigValidator::is_port(self.ca_port, "ca_port")?;
            }
            (None, None) => {
                return Err(ConfigError::invalid(
                    "directory_url",
                    "set directory_url or ca_host",
                ));
            }
        }

        ConfigValidator::non_empty_list(&self.domains, "domains")?;
        ConfigValidator::non_empty_list(&self.contacts, "contacts")?;
        for contact in &self.contacts {
            ConfigValidator::is_email(contact, "contacts")?;
        }

        ConfigValidator::one_of(&self.challenge_type, CHALLENGE_TYPES, "challenge_type")?;
        ConfigValidator::one_of(&self.key_curve, KEY_CURVES, "key_curve")?;
        ConfigValidator::is_socket_addr(&self.listen_addr, "listen_addr")?;

        ConfigValidator::in_range(self.poll_interval_secs, 1, 3600, "poll_interval_secs")?;
        ConfigValidator::in_range(self.poll_attempts, 1, 10_000, "poll_attempts")?;
        ConfigValidator::in_range(self.account_retry_secs, 1, u64::MAX, "account_retry_secs")?;
        ConfigValidator::in_range(self.order_retry_secs, 1, u64::MAX, "order_retry_secs")?;
        ConfigValidator::in_range(self.renewal_interval_secs, 60, u64::MAX, "renewal_interval_secs")?;
        ConfigValidator::in_range(self.challenge_ttl_secs, 1, u64::MAX, "challenge_ttl_secs")?;
        ConfigValidator::in_range(self.chain_buffer_bytes, 1024, 1 << 20, "chain_buffer_bytes")?;

        ConfigValidator::one_of(&self.log_level, LOG_LEVELS, "log_level")?;
        ConfigValidator::one_of(&self.log_format, LOG_FORMATS, "log_format")?;

        if !self.accept_tos {
            return Err(ConfigError::invalid(
                "accept_tos",
                "the CA's terms of service must be accepted before registering",
            ));
        }
        Ok(())
    }
}

/// Accept either a list or a comma separated string, as environment variables give
fn string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match ListOrString::deserialize(deserializer)? {
        ListOrString::List(items) => items,
        ListOrString::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    })
}
