//! ACME account registration

use crate::error::{AcmeError, Result};
use crate::keys::KeyPair;
use serde::Serialize;
use std::sync::Arc;

/// Account creation request
#[derive(Debug, Clone, Serialize)]
pub struct AccountCreate {
    /// Contact information
    pub contact: Vec<String>,

    /// Terms of service agreement
    #[serde(rename = "termsOfServiceAgreed")]
    pub terms_of_service_agreed: bool,
}

impl AccountCreate {
    /// Create a new account creation request
    pub fn new(contact: Vec<String>, terms_of_service_agreed: bool) -> Self {
        Self {
            contact,
            terms_of_service_agreed,
        }
    }
}

/// Parameters for one account registration attempt
#[derive(Debug, Clone)]
pub struct AccountParams {
    /// Contacts, in order
    pub contacts: Vec<String>,
    /// Whether the CA's terms of service are accepted
    pub terms_of_service_agreed: bool,
    /// Key the account is registered with
    pub key: Arc<KeyPair>,
}

impl AccountParams {
    pub fn new(contacts: Vec<String>, terms_of_service_agreed: bool, key: Arc<KeyPair>) -> Self {
        Self {
            contacts,
            terms_of_service_agreed,
            key,
        }
    }

    /// Check the contact list and build the wire request.
    ///
    /// Bare e-mail addresses are turned into `mailto:` URIs.
    pub fn to_request(&self) -> Result<AccountCreate> {
        if self.contacts.is_empty() {
            return Err(AcmeError::InvalidConfig(
                "At least one account contact is required".to_string(),
            ));
        }

        let mut contact = Vec::with_capacity(self.contacts.len());
        for entry in &self.contacts {
            let entry = entry.trim();
            if entry.is_empty() {
                return Err(AcmeError::InvalidConfig(
                    "Account contact cannot be empty".to_string(),
                ));
            }
            if entry.contains(':') {
                contact.push(entry.to_string());
            } else {
                contact.push(format!("mailto:{}", entry));
            }
        }

        Ok(AccountCreate::new(contact, self.terms_of_service_agreed))
    }
}

/// A registered account: the CA-assigned URL and the key that owns it
#[derive(Debug, Clone)]
pub struct AccountSession {
    /// Account URL, used as the JWS `kid`
    pub url: String,
    /// Account key
    pub key: Arc<KeyPair>,
}
