/// ACME directory and metadata
use serde::{Deserialize, Serialize};

/// ACME directory structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    /// URL for creating new accounts
    #[serde(rename = "newAccount")]
    pub new_account: String,

    /// URL for creating new orders
    #[serde(rename = "newOrder")]
    pub new_order: String,

    /// URL for creating new nonces
    #[serde(rename = "newNonce")]
    pub new_nonce: String,

    /// URL for revoking certificates
    #[serde(rename = "revokeCert", default, skip_serializing_if = "Option::is_none")]
    pub revoke_cert: Option<String>,

    /// Optional: URL for key change
    #[serde(rename = "keyChange", skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,

    /// Optional: Directory metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

impl Directory {
    /// Whether the CA requires the client to agree to terms of service
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.as_deref())
    }
}

/// ACME directory metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryMeta {
    /// Terms of service URL
    #[serde(rename = "termsOfService", skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,

    /// Website URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    /// CAA identities
    #[serde(rename = "caaIdentities", skip_serializing_if = "Option::is_none")]
    pub caa_identities: Option<Vec<String>>,

    /// Whether external account binding is required
    #[serde(
        rename = "externalAccountRequired",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_account_required: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_deserialization() {
        let json = r#"{
            "newAccount": "https://ca.test/acme/new-account",
            "newOrder": "https://ca.test/acme/new-order",
            "newNonce": "https://ca.test/acme/new-nonce",
            "revokeCert": "https://ca.test/acme/revoke-cert"
        }"#;

        let directory: Directory = serde_json::from_str(json).unwrap();
        assert_eq!(directory.new_account, "https://ca.test/acme/new-account");
        assert_eq!(directory.new_order, "https://ca.test/acme/new-order");
        assert!(directory.terms_of_service().is_none());
    }

    #[test]
    fn test_directory_with_meta() {
        let json = r#"{
            "newAccount": "https://ca.test/acme/new-account",
            "newOrder": "https://ca.test/acme/new-order",
            "newNonce": "https://ca.test/acme/new-nonce",
            "meta": {
                "termsOfService": "https://ca.test/tos",
                "externalAccountRequired": false
            }
        }"#;

        let directory: Directory = serde_json::from_str(json).unwrap();
        assert!(directory.revoke_cert.is_none());
        assert_eq!(directory.terms_of_service(), Some("https://ca.test/tos"));
    }
}
