//! Flattened JWS request bodies (RFC 8555 §6.2)

use crate::error::Result;
use crate::keys::KeyPair;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;

/// How the signing key is identified in the protected header
#[derive(Debug, Clone, Copy)]
pub enum KeyId<'a> {
    /// Embed the public key; only for `newAccount`
    Jwk,
    /// Reference a registered account by URL
    Kid(&'a str),
}

/// Flattened JSON serialization of a signed request
#[derive(Debug, Serialize)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl Jws {
    /// Sign `payload` for `url`. `None` produces a POST-as-GET body.
    pub fn sign(
        key: &KeyPair,
        key_id: KeyId<'_>,
        nonce: &str,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Self> {
        let mut header = serde_json::json!({
            "alg": key.curve().jws_alg(),
            "nonce": nonce,
            "url": url,
        });
        match key_id {
            KeyId::Jwk => header["jwk"] = key.jwk(),
            KeyId::Kid(kid) => header["kid"] = serde_json::Value::String(kid.to_string()),
        }

        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?),
            None => String::new(),
        };

        let signing_input = format!("{}.{}", protected, payload);
        let signature = URL_SAFE_NO_PAD.encode(key.sign(signing_input.as_bytes())?);

        Ok(Self {
            protected,
            payload,
            signature,
        })
    }
}
