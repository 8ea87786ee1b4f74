//! JWKS cache for access-token verification keys.
//!
//! Entries are keyed by `kid` and never expire on their own. A lookup miss
//! triggers one fetch of `<base>/.well-known/jwks.json`, which overwrites the
//! entries it carries, then the lookup is retried once. Concurrent misses
//! queue on a refresh gate and re-check the cache before fetching, so a burst
//! of requests for a freshly rotated key costs a single round-trip.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Well-known JWKS path relative to the IdP base URL.
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// JWKS lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// `kid` is absent from the IdP's key set even after a refresh.
    #[error("key id not found: {0}")]
    NotFound(String),

    /// The key set could not be fetched or parsed.
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),

    /// The entry exists but carries no usable RSA key.
    #[error("unusable key {kid}: {reason}")]
    InvalidKey {
        /// Key id
        kid: String,
        /// What was wrong with it
        reason: String,
    },
}

/// One key from the IdP's key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (`RSA`)
    #[serde(default)]
    pub kty: String,
    /// Key id
    #[serde(default)]
    pub kid: Option<String>,
    /// Intended use (`sig`)
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    /// RSA modulus (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// Certificate chain (base64 DER), leaf first
    #[serde(default)]
    pub x5c: Vec<String>,
}

impl Jwk {
    /// First `x5c` certificate wrapped in a PEM envelope.
    #[must_use]
    pub fn certificate_pem(&self) -> Option<String> {
        let der_b64 = self.x5c.first()?;
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        let bytes = der_b64.as_bytes();
        for chunk in bytes.chunks(64) {
            pem.push_str(&String::from_utf8_lossy(chunk));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        Some(pem)
    }

    /// Verification key: RSA components when present, else the `x5c` leaf.
    fn decoding_key(&self) -> std::result::Result<DecodingKey, String> {
        if let (Some(n), Some(e)) = (self.n.as_deref(), self.e.as_deref()) {
            return DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string());
        }

        let der_b64 = self
            .x5c
            .first()
            .ok_or_else(|| "neither n/e nor x5c present".to_string())?;
        let der = base64::engine::general_purpose::STANDARD
            .decode(der_b64)
            .map_err(|e| format!("x5c is not base64: {e}"))?;
        let (_, cert) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| format!("x5c is not a certificate: {e}"))?;

        Ok(DecodingKey::from_rsa_der(
            &cert.public_key().subject_public_key.data,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

/// Miss-driven JWKS cache, shared by all requests.
pub struct JwksCache {
    jwks_url: String,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, Jwk>>,
    refresh_gate: Mutex<()>,
}

impl JwksCache {
    /// Cache for the IdP at `base_url` with an outbound `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(
            format!("{}{JWKS_PATH}", base_url.trim_end_matches('/')),
            http,
        ))
    }

    /// Cache fetching from an explicit JWKS URL.
    #[must_use]
    pub fn with_client(jwks_url: String, http: reqwest::Client) -> Self {
        Self {
            jwks_url,
            http,
            keys: RwLock::new(HashMap::new()),
            refresh_gate: Mutex::new(()),
        }
    }

    /// URL the key set is fetched from.
    #[must_use]
    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Whether nothing has been fetched yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// PEM certificate for `kid`, refreshing once on a miss.
    pub async fn cert_for_kid(&self, kid: &str) -> std::result::Result<String, JwksError> {
        let jwk = self.lookup(kid).await?;
        jwk.certificate_pem().ok_or_else(|| JwksError::InvalidKey {
            kid: kid.to_string(),
            reason: "no x5c certificate".to_string(),
        })
    }

    /// Verification key for `kid`, refreshing once on a miss.
    pub async fn decoding_key(&self, kid: &str) -> std::result::Result<DecodingKey, JwksError> {
        let jwk = self.lookup(kid).await?;
        jwk.decoding_key().map_err(|reason| JwksError::InvalidKey {
            kid: kid.to_string(),
            reason,
        })
    }

    /// Fetch the key set and overwrite cached entries by `kid`.
    ///
    /// Returns the number of keys received.
    pub async fn refresh(&self) -> std::result::Result<usize, JwksError> {
        debug!(url = %self.jwks_url, "Fetching JWKS");

        let response = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JwksError::Fetch(format!("HTTP {status}: {body}")));
        }

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::Fetch(format!("invalid JWKS document: {e}")))?;

        let count = set.keys.len();
        let mut keys = self.keys.write();
        for jwk in set.keys {
            match jwk.kid.clone() {
                Some(kid) => {
                    keys.insert(kid, jwk);
                }
                None => warn!(kty = %jwk.kty, "Skipping JWK without kid"),
            }
        }
        debug!(received = count, cached = keys.len(), "JWKS refreshed");
        Ok(count)
    }

    fn cached(&self, kid: &str) -> Option<Jwk> {
        self.keys.read().get(kid).cloned()
    }

    async fn lookup(&self, kid: &str) -> std::result::Result<Jwk, JwksError> {
        if let Some(jwk) = self.cached(kid) {
            return Ok(jwk);
        }

        let _gate = self.refresh_gate.lock().await;
        // Another request may have refreshed while we waited.
        if let Some(jwk) = self.cached(kid) {
            return Ok(jwk);
        }

        self.refresh().await?;
        self.cached(kid)
            .ok_or_else(|| JwksError::NotFound(kid.to_string()))
    }
}
