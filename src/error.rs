//! Error types for the authorization gateway

use std::io;

use thiserror::Error;

/// Result type alias for the authorization gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Authorization gateway errors
///
/// Every variant reduces to one of a handful of HTTP outcomes at the edge
/// (see [`Error::status`]). The text is for logs only; the response body is
/// the status reason.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// RSA key material could not be loaded or generated (fatal at startup)
    #[error("Key material error: {0}")]
    KeyMaterial(String),

    /// JWKS or token-exchange call failed at the transport level
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The IdP answered with an HTTP error status
    #[error("Upstream refused with HTTP {status}: {body}")]
    UpstreamRefused {
        /// HTTP status returned by the IdP
        status: u16,
        /// Response body, captured for logs
        body: String,
    },

    /// Request, state or claim shape is invalid
    #[error("Malformed: {0}")]
    Malformed(String),

    /// Credential missing or invalid
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status the outer adapter uses when this error terminates a request.
    #[must_use]
    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;

        match self {
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_)
            | Self::UpstreamUnavailable(_)
            | Self::UpstreamRefused { .. }
            | Self::Http(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
