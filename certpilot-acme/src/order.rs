/// ACME order management
use crate::config::ChallengeType;
use crate::error::{AcmeError, Result};
use crate::keys::KeyPair;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// ACME order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Order status
    pub status: OrderStatus,

    /// Expiration timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,

    /// List of identifier objects
    pub identifiers: Vec<Identifier>,

    /// Authorization URLs
    pub authorizations: Vec<String>,

    /// Finalize URL
    pub finalize: String,

    /// Certificate URL (available when status is valid)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    /// Problem that made the order invalid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// Order status
///
/// `None` is the client-side value before an order exists; the CA never
/// sends it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
    /// No order has been created yet
    #[default]
    None,
    /// Order is pending authorization
    Pending,
    /// Order is ready for finalization
    Ready,
    /// Order is processing
    Processing,
    /// Order is valid and certificate is available
    Valid,
    /// Order is invalid
    Invalid,
}

impl OrderStatus {
    /// VALID and INVALID end the polling loop
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Valid | OrderStatus::Invalid)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::None => "none",
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// RFC 7807 problem document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Problem {
    /// Problem type URN
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// HTTP status echoed by the CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.problem_type, &self.detail) {
            (Some(t), Some(d)) => write!(f, "{}: {}", t, d),
            (Some(t), None) => f.write_str(t),
            (None, Some(d)) => f.write_str(d),
            (None, None) => f.write_str("unspecified problem"),
        }
    }
}

/// Domain identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identifier {
    /// Identifier type (usually "dns")
    #[serde(rename = "type")]
    pub id_type: String,

    /// Identifier value (domain name)
    pub value: String,
}

impl Identifier {
    /// Create a DNS identifier
    pub fn dns(domain: impl Into<String>) -> Self {
        Self {
            id_type: "dns".to_string(),
            value: domain.into(),
        }
    }
}

/// Order creation request
#[derive(Debug, Clone, Serialize)]
pub struct OrderCreate {
    /// List of identifiers to order
    pub identifiers: Vec<Identifier>,
}

impl OrderCreate {
    /// Create a new order for domains
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            identifiers: domains.into_iter().map(Identifier::dns).collect(),
        }
    }
}

/// One requested domain and the challenge used to prove control of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRequest {
    pub name: String,
    pub challenge: ChallengeType,
}

impl DomainRequest {
    pub fn tls_alpn(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            challenge: ChallengeType::TlsAlpn01,
        }
    }
}

/// Parameters for one order cycle
#[derive(Debug, Clone)]
pub struct OrderParams {
    /// Requested domains, in order
    pub domains: Vec<DomainRequest>,
    /// Key the certificate is issued for; never reused across orders
    pub key: Arc<KeyPair>,
}

impl OrderParams {
    pub fn new(domains: Vec<DomainRequest>, key: Arc<KeyPair>) -> Self {
        Self { domains, key }
    }

    /// Domain names, in order
    pub fn names(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.name.clone()).collect()
    }

    /// Check the domain list and build the wire request
    pub fn to_request(&self) -> Result<OrderCreate> {
        if self.domains.is_empty() {
            return Err(AcmeError::InvalidConfig(
                "An order needs at least one domain".to_string(),
            ));
        }
        for domain in &self.domains {
            if !is_valid_dns_name(&domain.name) {
                return Err(AcmeError::InvalidConfig(format!(
                    "Not a valid DNS name: {}",
                    domain.name
                )));
            }
        }
        Ok(OrderCreate::new(self.names()))
    }
}

/// Whether `name` is a fully qualified DNS name a CA could validate
pub fn is_valid_dns_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Curve, KeyMaterialProvider};

    #[test]
    fn test_identifier_dns() {
        let identifier = Identifier::dns("example.test");
        assert_eq!(identifier.id_type, "dns");
        assert_eq!(identifier.value, "example.test");
    }

    #[test]
    fn test_order_create() {
        let order = OrderCreate::new(vec![
            "example.test".to_string(),
            "www.example.test".to_string(),
        ]);

        assert_eq!(order.identifiers.len(), 2);
        assert_eq!(order.identifiers[0].value, "example.test");
        assert_eq!(order.identifiers[1].value, "www.example.test");
    }

    #[test]
    fn test_order_status_serialization() {
        let status = OrderStatus::Valid;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"valid\"");
        assert_eq!(OrderStatus::default(), OrderStatus::None);
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
    }

    #[test]
    fn test_order_with_problem() {
        let json = r#"{
            "status": "invalid",
            "identifiers": [{"type": "dns", "value": "example.test"}],
            "authorizations": ["https://ca.test/authz/1"],
            "finalize": "https://ca.test/finalize/1",
            "error": {"type": "urn:ietf:params:acme:error:unauthorized", "detail": "bad cert"}
        }"#;

        let order: Order = serde_json::from_str(json).unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
        assert!(order.error.unwrap().to_string().contains("bad cert"));
    }

    #[test]
    fn test_dns_name_validation() {
        assert!(is_valid_dns_name("example.test"));
        assert!(is_valid_dns_name("a-b.example.test."));
        assert!(!is_valid_dns_name("localhost"));
        assert!(!is_valid_dns_name("-bad.example.test"));
        assert!(!is_valid_dns_name("bad_name.example.test"));
        assert!(!is_valid_dns_name("example..test"));
        assert!(!is_valid_dns_name(&format!("{}.test", "a".repeat(64))));
    }

    #[test]
    fn test_order_params_validation() {
        let key = Arc::new(
            KeyMaterialProvider::new()
                .generate_key_pair(Curve::P256)
                .unwrap(),
        );

        let empty = OrderParams::new(vec![], key.clone());
        assert!(empty.to_request().is_err());

        let params = OrderParams::new(vec![DomainRequest::tls_alpn("example.test")], key);
        let request = params.to_request().unwrap();
        assert_eq!(request.identifiers, vec![Identifier::dns("example.test")]);
    }
}
