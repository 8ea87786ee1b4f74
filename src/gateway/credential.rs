//! Credential extraction and access-token validation.
//!
//! # Validation order
//!
//! Cheap checks run first so most bad tokens never cost a JWKS round-trip
//! beyond the key lookup:
//!
//! 1. `kid` header present.
//! 2. Verification key for `kid` from the JWKS cache.
//! 3. Payload parses as a JSON object.
//! 4. `aud` contains the tenant audience (string or array form).
//! 5. `iss` equals the configured issuer.
//! 6. `exp` / `nbf` / `iat` valid relative to now (60 s leeway).
//! 7. Every token in `scope` is allowed by the matched rule.
//! 8. Header algorithm is RS256.
//! 9. Signature verifies.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, header};
use base64::Engine;
use jsonwebtoken::{Algorithm, Validation};
use serde_json::{Map, Value};

use crate::jwks::{JwksCache, JwksError};
use crate::policy::CompiledRule;

/// Cookie carrying the IdP access token.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// Clock skew tolerated on access-token time claims.
pub const LEEWAY_SECS: u64 = 60;

/// Where a credential was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `access_token` cookie
    Cookie,
    /// `Authorization: Bearer` header
    Header,
}

/// Bearer credential presented by the caller.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Compact JWT
    pub token: String,
    /// Where it came from
    pub source: CredentialSource,
    authorization: Option<HeaderValue>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// `Authorization` value to hand upstream on admit: the caller's own
    /// header, or `Bearer <cookie>` when the token came from the cookie.
    #[must_use]
    pub fn authorization(&self) -> Option<HeaderValue> {
        match &self.authorization {
            Some(value) => Some(value.clone()),
            None => HeaderValue::from_str(&format!("Bearer {}", self.token)).ok(),
        }
    }
}

/// Find the caller's credential: the `access_token` cookie first, then
/// `Authorization: Bearer <token>`.
#[must_use]
pub fn extract_credential(headers: &HeaderMap) -> Option<Credential> {
    if let Some(token) = cookie_value(headers, ACCESS_TOKEN_COOKIE) {
        return Some(Credential {
            token,
            source: CredentialSource::Cookie,
            authorization: None,
        });
    }

    let value = headers.get(header::AUTHORIZATION)?;
    let mut parts = value.to_str().ok()?.split_whitespace();
    let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    Some(Credential {
        token: token.to_string(),
        source: CredentialSource::Header,
        authorization: Some(value.clone()),
    })
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.trim_matches('"').to_string())
}

/// Why an access token was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Header has no `kid`.
    #[error("token header has no kid")]
    MissingKid,

    /// Header or payload cannot be decoded.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// No verification key for `kid`.
    #[error(transparent)]
    Keys(#[from] JwksError),

    /// `aud` does not contain the tenant audience.
    #[error("audience mismatch (expected {0})")]
    AudienceMismatch(String),

    /// `iss` is not the configured issuer.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer
        expected: String,
        /// Token issuer
        actual: String,
    },

    /// `exp` missing or in the past.
    #[error("token expired")]
    Expired,

    /// `nbf` or `iat` in the future.
    #[error("token not yet valid")]
    NotYetValid,

    /// A scope in the token is not allowed by the matched rule.
    #[error("scope '{0}' not allowed")]
    ScopeNotAllowed(String),

    /// Header algorithm is not RS256.
    #[error("unsupported algorithm {0:?}")]
    WrongAlgorithm(Algorithm),

    /// Signature does not verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// Verifies IdP-issued access tokens against the JWKS cache.
#[derive(Clone)]
pub struct AccessTokenValidator {
    jwks: Arc<JwksCache>,
    issuer: String,
}

impl AccessTokenValidator {
    /// Validator for tokens issued by `issuer`.
    #[must_use]
    pub fn new(jwks: Arc<JwksCache>, issuer: impl Into<String>) -> Self {
        Self {
            jwks,
            issuer: issuer.into(),
        }
    }

    /// Expected `iss` value.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Validate `token` for `audience` under `rule` and return its claims.
    ///
    /// With no matching rule the scope check is skipped.
    pub async fn validate(
        &self,
        token: &str,
        audience: &str,
        rule: Option<&CompiledRule>,
    ) -> Result<Map<String, Value>, ValidationError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let kid = header.kid.as_deref().ok_or(ValidationError::MissingKid)?;

        let key = self.jwks.decoding_key(kid).await?;

        let claims = unverified_claims(token)?;

        if !audience_matches(claims.get("aud"), audience) {
            return Err(ValidationError::AudienceMismatch(audience.to_string()));
        }

        let iss = claims.get("iss").and_then(Value::as_str).unwrap_or_default();
        if iss != self.issuer {
            return Err(ValidationError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: iss.to_string(),
            });
        }

        check_times(&claims, jsonwebtoken::get_current_timestamp())?;

        if let (Some(rule), Some(scope)) = (rule, claims.get("scope").and_then(Value::as_str)) {
            if let Some(denied) = scope.split_whitespace().find(|s| !rule.allows_scopes(s)) {
                return Err(ValidationError::ScopeNotAllowed(denied.to_string()));
            }
        }

        if header.alg != Algorithm::RS256 {
            return Err(ValidationError::WrongAlgorithm(header.alg));
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = LEEWAY_SECS;
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        jsonwebtoken::decode::<Value>(token, &key, &validation)
            .map_err(|e| ValidationError::InvalidSignature(e.to_string()))?;

        Ok(claims)
    }
}

/// Decode the payload without checking the signature.
fn unverified_claims(token: &str) -> Result<Map<String, Value>, ValidationError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ValidationError::Malformed("not a compact JWT".to_string()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ValidationError::Malformed(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ValidationError::Malformed(format!("claims are not an object: {e}")))
}

fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(s)) => s == expected,
        Some(Value::Array(arr)) => arr.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}

#[allow(clippy::cast_precision_loss)]
fn check_times(claims: &Map<String, Value>, now: u64) -> Result<(), ValidationError> {
    let now = now as f64;
    let leeway = LEEWAY_SECS as f64;

    let exp = claims
        .get("exp")
        .and_then(Value::as_f64)
        .ok_or(ValidationError::Expired)?;
    if now > exp + leeway {
        return Err(ValidationError::Expired);
    }

    for claim in ["nbf", "iat"] {
        if let Some(t) = claims.get(claim) {
            let t = t
                .as_f64()
                .ok_or_else(|| ValidationError::Malformed(format!("{claim} is not numeric")))?;
            if t > now + leeway {
                return Err(ValidationError::NotYetValid);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn cookie_wins_over_header() {
        let h = headers(&[
            (header::COOKIE, "theme=dark; access_token=from-cookie"),
            (header::AUTHORIZATION, "Bearer from-header"),
        ]);
        let cred = extract_credential(&h).unwrap();
        assert_eq!(cred.token, "from-cookie");
        assert_eq!(cred.source, CredentialSource::Cookie);
        assert_eq!(
            cred.authorization().unwrap(),
            HeaderValue::from_static("Bearer from-cookie")
        );
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let h = headers(&[(header::AUTHORIZATION, "BEARER abc.def.ghi")]);
        let cred = extract_credential(&h).unwrap();
        assert_eq!(cred.token, "abc.def.ghi");
        // the caller's header is echoed verbatim
        assert_eq!(cred.authorization().unwrap(), "BEARER abc.def.ghi");
    }

    #[test]
    fn malformed_authorization_is_no_credential() {
        for value in ["Bearer", "Basic dXNlcjpwYXNz", "Bearer a b", ""] {
            let h = headers(&[(header::AUTHORIZATION, value)]);
            assert!(extract_credential(&h).is_none(), "{value:?}");
        }
        assert!(extract_credential(&HeaderMap::new()).is_none());
    }

    #[test]
    fn empty_cookie_falls_back_to_header() {
        let h = headers(&[
            (header::COOKIE, "access_token="),
            (header::AUTHORIZATION, "Bearer h"),
        ]);
        assert_eq!(extract_credential(&h).unwrap().source, CredentialSource::Header);
    }

    #[test]
    fn audience_accepts_string_or_array() {
        assert!(audience_matches(Some(&json!("friends")), "friends"));
        assert!(audience_matches(Some(&json!(["x", "friends"])), "friends"));
        assert!(!audience_matches(Some(&json!(["x"])), "friends"));
        assert!(!audience_matches(None, "friends"));
    }

    #[test]
    fn time_claims_respect_leeway() {
        let now = 1_000_000;
        let ok = json!({"exp": now + 10, "iat": now, "nbf": now});
        assert!(check_times(ok.as_object().unwrap(), now).is_ok());

        let within_leeway = json!({"exp": now - 30});
        assert!(check_times(within_leeway.as_object().unwrap(), now).is_ok());

        let expired = json!({"exp": now - 120});
        assert!(matches!(
            check_times(expired.as_object().unwrap(), now),
            Err(ValidationError::Expired)
        ));

        let missing_exp = json!({"iat": now});
        assert!(matches!(
            check_times(missing_exp.as_object().unwrap(), now),
            Err(ValidationError::Expired)
        ));

        let future = json!({"exp": now + 600, "nbf": now + 300});
        assert!(matches!(
            check_times(future.as_object().unwrap(), now),
            Err(ValidationError::NotYetValid)
        ));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(matches!(
            unverified_claims("1234"),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            unverified_claims("a.!!!.c"),
            Err(ValidationError::Malformed(_))
        ));
        // base64url of `[1]`
        assert!(matches!(
            unverified_claims("a.WzFd.c"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn token_without_kid_fails_before_any_fetch() {
        // Unroutable JWKS: reaching the network would error differently.
        let jwks = Arc::new(JwksCache::with_client(
            "http://127.0.0.1:9/jwks".to_string(),
            reqwest::Client::new(),
        ));
        let validator = AccessTokenValidator::new(jwks, "https://idp/");

        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &json!({"aud": "friends"}),
            &jsonwebtoken::EncodingKey::from_secret(b"k"),
        )
        .unwrap();

        let err = validator.validate(&token, "friends", None).await.unwrap_err();
        assert!(matches!(err, ValidationError::MissingKid));
    }
}
