//! RSA signer for state tokens.
//!
//! The signer holds one RSA keypair for the process lifetime. Keys come from
//! PEM files when both paths are configured and readable; otherwise a fresh
//! 2048-bit keypair is generated in memory and outstanding state tokens do not
//! survive a restart.
//!
//! State tokens are RS256 JWTs carrying `{exp, iat, nbf, jti, redirect_url}`.
//! There is no replay store: `exp` is the only bound on reuse.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind,
};
use rsa::{
    RsaPrivateKey,
    pkcs1::EncodeRsaPrivateKey,
    pkcs8::{EncodePublicKey, LineEnding},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{info, warn};

use crate::{Error, Result};

/// RSA modulus size for generated keys.
pub const KEY_BITS: usize = 2048;

/// Failure to produce a signed token.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// The JWT library rejected the claims or key.
    #[error("failed to sign token: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
}

/// Reasons a token fails verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Signature does not verify, or the token is not RS256.
    #[error("invalid signature")]
    InvalidSignature,

    /// `exp` is in the past.
    #[error("token expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("token not yet valid")]
    NotYetValid,

    /// Not a JWT, or claims missing / of the wrong shape.
    #[error("malformed token: {0}")]
    Malformed(String),
}

impl From<SignError> for Error {
    fn from(e: SignError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<VerifyError> for Error {
    fn from(e: VerifyError) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Claims carried by the `state` parameter across the IdP round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateClaims {
    /// Expiry (Unix seconds)
    pub exp: u64,
    /// Issued-at (Unix seconds)
    pub iat: u64,
    /// Not-before (Unix seconds)
    pub nbf: u64,
    /// Random token id
    pub jti: String,
    /// Absolute URL the user agent requested before the challenge
    pub redirect_url: String,
}

impl StateClaims {
    /// Fresh claims valid from now for `ttl`.
    #[must_use]
    pub fn new(redirect_url: impl Into<String>, ttl: Duration) -> Self {
        let now = jsonwebtoken::get_current_timestamp();
        Self {
            exp: now.saturating_add(ttl.as_secs()),
            iat: now,
            nbf: now,
            jti: uuid::Uuid::new_v4().to_string(),
            redirect_url: redirect_url.into(),
        }
    }
}

/// Holds the RSA keypair; immutable after construction.
pub struct Signer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    private_pem: Vec<u8>,
    public_pem: Vec<u8>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("public_pem_len", &self.public_pem.len())
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Load the keypair from disk, or generate one when either path is
    /// missing or unreadable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyMaterial`] if the files are readable but do not
    /// hold valid PEM keys, or if generation fails.
    pub fn load_or_generate(private_key: Option<&Path>, public_key: Option<&Path>) -> Result<Self> {
        if let (Some(private_path), Some(public_path)) = (private_key, public_key) {
            match (std::fs::read(private_path), std::fs::read(public_path)) {
                (Ok(private_pem), Ok(public_pem)) => {
                    let signer = Self::from_pem(&private_pem, &public_pem)?;
                    info!(
                        private_key = %private_path.display(),
                        public_key = %public_path.display(),
                        "Loaded signing keypair"
                    );
                    return Ok(signer);
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Signing keys not readable, generating an ephemeral keypair");
                }
            }
        }

        let signer = Self::generate()?;
        info!(bits = KEY_BITS, "Generated ephemeral signing keypair");
        Ok(signer)
    }

    /// Generate a fresh in-memory keypair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyMaterial`] if the RNG or PEM encoding fails.
    pub fn generate() -> Result<Self> {
        let mut rng = rand_core::OsRng;
        let key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| Error::KeyMaterial(format!("RSA key generation failed: {e}")))?;

        let private_pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::KeyMaterial(format!("private key encoding failed: {e}")))?;
        let public_pem = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::KeyMaterial(format!("public key encoding failed: {e}")))?;

        Self::from_pem(private_pem.as_bytes(), public_pem.as_bytes())
    }

    /// Build from PEM PKCS#1 (or PKCS#8) private and PKIX public keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyMaterial`] if either PEM cannot be parsed.
    pub fn from_pem(private_pem: &[u8], public_pem: &[u8]) -> Result<Self> {
        let encoding = EncodingKey::from_rsa_pem(private_pem)
            .map_err(|e| Error::KeyMaterial(format!("invalid private key: {e}")))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem)
            .map_err(|e| Error::KeyMaterial(format!("invalid public key: {e}")))?;

        Ok(Self {
            encoding,
            decoding,
            private_pem: private_pem.to_vec(),
            public_pem: public_pem.to_vec(),
        })
    }

    /// Sign arbitrary claims as an RS256 JWT.
    pub fn sign<T: Serialize>(&self, claims: &T) -> std::result::Result<String, SignError> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            claims,
            &self.encoding,
        )?)
    }

    /// Verify an RS256 JWT produced by this signer and return its claims.
    ///
    /// `exp` is required; `nbf` is checked when present. No clock leeway.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> std::result::Result<T, VerifyError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        jsonwebtoken::decode::<T>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    VerifyError::InvalidSignature
                }
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                ErrorKind::ImmatureSignature => VerifyError::NotYetValid,
                _ => VerifyError::Malformed(e.to_string()),
            })
    }

    /// Mint a state token binding the challenge to `redirect_url`.
    pub fn issue_state(&self, redirect_url: &str, ttl: Duration) -> std::result::Result<String, SignError> {
        self.sign(&StateClaims::new(redirect_url, ttl))
    }

    /// Verify a state token and return its claims.
    pub fn verify_state(&self, token: &str) -> std::result::Result<StateClaims, VerifyError> {
        if token.is_empty() {
            return Err(VerifyError::Malformed("empty state".to_string()));
        }
        self.verify(token)
    }

    /// PKIX public key PEM.
    #[must_use]
    pub fn public_key_pem(&self) -> &[u8] {
        &self.public_pem
    }

    /// PKCS#1 private key PEM.
    #[must_use]
    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_pem
    }

    /// Write the keypair so a later start can load it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if either file cannot be written.
    pub fn write_pem_files(&self, private_key: &Path, public_key: &Path) -> Result<()> {
        std::fs::write(private_key, &self.private_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(private_key, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::write(public_key, &self.public_pem)?;
        Ok(())
    }
}
