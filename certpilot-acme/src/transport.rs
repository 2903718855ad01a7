//! Authenticated HTTP session with the CA
//!
//! [`AcmeTransport`] is the seam between the order workflow and the network.
//! [`HttpTransport`] is the reqwest-backed implementation; tests drive the
//! workflow with an in-memory CA instead.

use crate::account::{AccountCreate, AccountSession};
use crate::challenge::{Authorization, Challenge};
use crate::config::AcmeConfig;
use crate::directory::Directory;
use crate::error::{AcmeError, BAD_NONCE, Result};
use crate::jws::{Jws, KeyId};
use crate::keys::KeyPair;
use crate::order::{Order, OrderCreate, Problem};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, LOCATION};
use std::time::Duration;
use tokio::sync::Mutex;

const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const REPLAY_NONCE: &str = "replay-nonce";

/// An order together with the URL the CA assigned to it
#[derive(Debug, Clone)]
pub struct OrderHandle {
    pub url: String,
    pub order: Order,
}

/// Requests the order workflow makes to the CA
#[async_trait]
pub trait AcmeTransport: Send + Sync {
    /// The CA's resource directory
    async fn directory(&self) -> Result<Directory>;

    /// Register an account and return its URL.
    ///
    /// An account that already exists for the key is reported as
    /// [`AcmeError::AccountAlreadyExists`].
    async fn new_account(&self, key: &KeyPair, request: &AccountCreate) -> Result<String>;

    async fn new_order(&self, account: &AccountSession, request: &OrderCreate) -> Result<OrderHandle>;

    async fn authorization(&self, account: &AccountSession, url: &str) -> Result<Authorization>;

    /// Tell the CA the challenge response is in place
    async fn challenge_ready(&self, account: &AccountSession, url: &str) -> Result<Challenge>;

    async fn order(&self, account: &AccountSession, url: &str) -> Result<Order>;

    /// Submit the DER-encoded CSR
    async fn finalize(&self, account: &AccountSession, url: &str, csr_der: &[u8]) -> Result<Order>;

    /// Download the PEM certificate chain
    async fn certificate(&self, account: &AccountSession, url: &str) -> Result<String>;
}

/// ACME transport over HTTPS
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    directory: Directory,
    nonce: Mutex<Option<String>>,
}

impl HttpTransport {
    /// Build the HTTPS client and resolve the directory
    ///
    /// # Example
    ///
    /// ```no_run
    /// use certpilot_acme::{AcmeConfig, HttpTransport};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = AcmeConfig::lets_encrypt_staging(
    ///     vec!["admin@example.com".to_string()],
    ///     vec!["example.com".to_string()],
    /// );
    /// let transport = HttpTransport::connect(&config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: &AcmeConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(concat!("certpilot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30));

        if let Some(path) = &config.ca_root_cert {
            let pem = tokio::fs::read(path).await.map_err(|e| {
                AcmeError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
            })?;
            let root = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| AcmeError::InvalidConfig(format!("Bad CA root: {}", e)))?;
            builder = builder.add_root_certificate(root);
        }

        let client = builder
            .build()
            .map_err(|e| AcmeError::Internal(e.to_string()))?;
        let directory = Self::resolve_directory(&client, &config.directory_url).await?;

        tracing::info!(directory = %config.directory_url, "Connected to ACME directory");

        Ok(Self {
            client,
            directory,
            nonce: Mutex::new(None),
        })
    }

    /// Fetch the ACME directory
    async fn resolve_directory(client: &reqwest::Client, url: &str) -> Result<Directory> {
        let response = client.get(url).send().await.map_err(classify)?;

        if !response.status().is_success() {
            return Err(AcmeError::InvalidDirectory(format!(
                "Failed to fetch directory: {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AcmeError::InvalidDirectory(e.to_string()))
    }

    async fn take_nonce(&self) -> Result<String> {
        if let Some(nonce) = self.nonce.lock().await.take() {
            return Ok(nonce);
        }

        let response = self
            .client
            .head(&self.directory.new_nonce)
            .send()
            .await
            .map_err(classify)?;
        replay_nonce(response.headers())
            .ok_or_else(|| AcmeError::InvalidResponse("newNonce returned no Replay-Nonce".to_string()))
    }

    async fn store_nonce(&self, headers: &HeaderMap) {
        if let Some(nonce) = replay_nonce(headers) {
            *self.nonce.lock().await = Some(nonce);
        }
    }

    /// POST a signed request, retrying once on a stale nonce
    async fn post(
        &self,
        url: &str,
        key: &KeyPair,
        key_id: KeyId<'_>,
        payload: Option<&serde_json::Value>,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut retried = false;
        loop {
            let nonce = self.take_nonce().await?;
            let body = serde_json::to_vec(&Jws::sign(key, key_id, &nonce, url, payload)?)?;

            let mut request = self
                .client
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .body(body);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }

            let response = request.send().await.map_err(classify)?;
            self.store_nonce(response.headers()).await;

            if response.status().is_success() {
                return Ok(response);
            }

            let err = rejection(response).await;
            if !retried && err.is_problem(BAD_NONCE) {
                tracing::debug!(url, "CA rejected nonce, retrying once");
                retried = true;
                continue;
            }
            return Err(err);
        }
    }

    async fn post_as_get<T: serde::de::DeserializeOwned>(
        &self,
        account: &AccountSession,
        url: &str,
    ) -> Result<T> {
        let response = self
            .post(url, &account.key, KeyId::Kid(&account.url), None, None)
            .await?;
        decode(response).await
    }
}

#[async_trait]
impl AcmeTransport for HttpTransport {
    async fn directory(&self) -> Result<Directory> {
        Ok(self.directory.clone())
    }

    async fn new_account(&self, key: &KeyPair, request: &AccountCreate) -> Result<String> {
        let payload = serde_json::to_value(request)?;
        let response = self
            .post(&self.directory.new_account, key, KeyId::Jwk, Some(&payload), None)
            .await?;

        let account_url = location(response.headers())?;
        match response.status() {
            StatusCode::OK => Err(AcmeError::AccountAlreadyExists { account_url }),
            _ => Ok(account_url),
        }
    }

    async fn new_order(&self, account: &AccountSession, request: &OrderCreate) -> Result<OrderHandle> {
        let payload = serde_json::to_value(request)?;
        let response = self
            .post(
                &self.directory.new_order,
                &account.key,
                KeyId::Kid(&account.url),
                Some(&payload),
                None,
            )
            .await?;

        let url = location(response.headers())?;
        let order = decode(response).await?;
        Ok(OrderHandle { url, order })
    }

    async fn authorization(&self, account: &AccountSession, url: &str) -> Result<Authorization> {
        self.post_as_get(account, url).await
    }

    async fn challenge_ready(&self, account: &AccountSession, url: &str) -> Result<Challenge> {
        let payload = serde_json::json!({});
        let response = self
            .post(url, &account.key, KeyId::Kid(&account.url), Some(&payload), None)
            .await?;
        decode(response).await
    }

    async fn order(&self, account: &AccountSession, url: &str) -> Result<Order> {
        self.post_as_get(account, url).await
    }

    async fn finalize(&self, account: &AccountSession, url: &str, csr_der: &[u8]) -> Result<Order> {
        let payload = serde_json::json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self
            .post(url, &account.key, KeyId::Kid(&account.url), Some(&payload), None)
            .await?;
        decode(response).await
    }

    async fn certificate(&self, account: &AccountSession, url: &str) -> Result<String> {
        let response = self
            .post(url, &account.key, KeyId::Kid(&account.url), None, Some(PEM_CHAIN))
            .await?;
        response.text().await.map_err(classify)
    }
}

fn replay_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REPLAY_NONCE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn location(headers: &HeaderMap) -> Result<String> {
    headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AcmeError::InvalidResponse("Response has no Location header".to_string()))
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let bytes = response.bytes().await.map_err(classify)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Turn an error response into `RequestRejected`, reading the problem document
async fn rejection(response: reqwest::Response) -> AcmeError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let problem: Problem = serde_json::from_str(&body).unwrap_or_default();

    let detail = problem
        .detail
        .or_else(|| (!body.is_empty()).then(|| body.clone()))
        .unwrap_or_else(|| status.to_string());

    AcmeError::RequestRejected {
        status: status.as_u16(),
        problem_type: problem.problem_type,
        detail,
    }
}

/// Map a reqwest failure onto the transport error taxonomy
fn classify(err: reqwest::Error) -> AcmeError {
    if has_tls_cause(&err) {
        AcmeError::TlsHandshakeFailed(err.to_string())
    } else if err.is_connect() || err.is_timeout() {
        AcmeError::Unreachable(err.to_string())
    } else {
        AcmeError::HttpError(err)
    }
}

fn has_tls_cause(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<rustls::Error>() {
            return true;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>())
        {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_ca() {
        // Nothing listens on the discard port
        let config = AcmeConfig::new("https://127.0.0.1:9/dir", vec![], vec![]);
        let result = HttpTransport::connect(&config).await;
        assert!(matches!(result, Err(AcmeError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_missing_root_file() {
        let config = AcmeConfig::new("https://127.0.0.1:9/dir", vec![], vec![])
            .with_ca_root_cert("/nonexistent/root.pem".into());
        let result = HttpTransport::connect(&config).await;
        assert!(matches!(result, Err(AcmeError::InvalidConfig(_))));
    }

    #[test]
    fn test_tls_cause_detection() {
        let wrapped = std::io::Error::other(rustls::Error::General("bad cert".into()));
        assert!(has_tls_cause(&wrapped));

        let plain = std::io::Error::other("connection reset");
        assert!(!has_tls_cause(&plain));
    }
}
