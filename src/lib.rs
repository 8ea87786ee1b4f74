//! Authorization Gateway Library
//!
//! Sidecar that admits or rejects every inbound HTTP request on the basis of
//! a per-host/per-path policy and a bearer credential.
//!
//! # Features
//!
//! - **Policy**: ordered host/path glob rules, hot-swapped from a watched resource file
//! - **JWT admission**: RS256 access tokens verified against the IdP's JWKS
//! - **OAuth2 challenge**: Authorization Code flow with signed, stateless state tokens
//! - **Multi-tenant**: per-hostname client id, audience and callback URL
//!
//! # Responses
//!
//! 200 admit, 303 challenge, 307 callback redirect, 400/401 deny.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod idp;
pub mod jwks;
pub mod policy;
pub mod signer;
pub mod tenant;
pub mod watcher;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
