//! HMAC-SHA256 primitives: compact HS256 tokens and request signatures

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SsoError};

type HmacSha256 = Hmac<Sha256>;

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionClaims {
    /// Internal user id
    pub sub: String,
    /// Organization the session acts for
    pub org: String,
    /// Product that signed the user in
    pub product: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

fn mac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key)
        .map_err(|e| SsoError::InvalidToken(format!("unusable signing key: {}", e)).into())
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| value.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Hex-encoded SHA-256 of `value`
pub fn sha256_hex(value: &str) -> String {
    to_hex(&Sha256::digest(value.as_bytes()))
}

/// Hex-encoded HMAC-SHA256 of `message` under `key`
pub fn hmac_hex(key: &str, message: &str) -> Result<String> {
    let mut mac = mac(key.as_bytes())?;
    mac.update(message.as_bytes());
    Ok(to_hex(&mac.finalize().into_bytes()))
}

/// Constant-time check of a hex-encoded HMAC-SHA256 signature
pub fn verify_hmac_hex(key: &str, message: &str, signature: &str) -> Result<()> {
    let signature = from_hex(signature.trim()).ok_or(SsoError::InvalidSignature)?;
    let mut mac = mac(key.as_bytes())?;
    mac.update(message.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| SsoError::InvalidSignature.into())
}

/// Signs and verifies compact HS256 tokens
#[derive(Clone)]
pub struct TokenSigner {
    key: SecretString,
}

impl TokenSigner {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    pub fn sign<C: Serialize>(&self, claims: &C) -> Result<String> {
        let payload = serde_json::to_vec(claims)
            .map_err(|e| SsoError::InvalidToken(format!("unencodable claims: {}", e)))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );

        let mut mac = mac(self.key.expose_secret().as_bytes())?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Check the signature and decode the claims; expiry is left to the caller
    pub fn verify<C: DeserializeOwned>(&self, token: &str) -> Result<C> {
        let malformed = || SsoError::InvalidToken("malformed token".to_string());
        let (signing_input, signature) = token.rsplit_once('.').ok_or_else(malformed)?;
        let (header, payload) = signing_input.split_once('.').ok_or_else(malformed)?;
        if payload.contains('.') {
            return Err(malformed().into());
        }

        let header = URL_SAFE_NO_PAD
            .decode(header)
            .map_err(|_| SsoError::InvalidToken("malformed header".to_string()))?;
        let header: serde_json::Value = serde_json::from_slice(&header)
            .map_err(|_| SsoError::InvalidToken("malformed header".to_string()))?;
        if header["alg"] != "HS256" {
            return Err(SsoError::InvalidToken("unsupported algorithm".to_string()).into());
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SsoError::InvalidToken("malformed signature".to_string()))?;
        let mut mac = mac(self.key.expose_secret().as_bytes())?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SsoError::InvalidToken("bad signature".to_string()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SsoError::InvalidToken("malformed payload".to_string()))?;
        serde_json::from_slice(&payload)
            .map_err(|e| SsoError::InvalidToken(format!("unexpected claims: {}", e)).into())
    }
}
