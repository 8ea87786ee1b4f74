//! Request-admission pipeline
//!
//! Every request runs through a fixed chain:
//! request log → panic recovery → tenant resolver → callback → JWT check →
//! authorize decision. Stages communicate through request extensions: the
//! resolver attaches the [`Tenant`](crate::tenant::Tenant) and
//! [`OriginalUrl`], the JWT check attaches the [`MatchedRule`].

pub mod authorize;
pub mod callback;
pub mod credential;
pub mod middleware;
mod router;
mod server;

use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error};

use crate::Error;
use crate::policy::CompiledRule;

pub use router::{GatewayState, admission_chain, create_router};
pub use server::Gateway;

/// Absolute URL the user agent requested, rebuilt from forwarded headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalUrl(pub String);

/// First policy rule matching the request, if any.
#[derive(Debug, Clone, Default)]
pub struct MatchedRule(pub Option<Arc<CompiledRule>>);

/// JSON error body: `{"message": "<lowercase reason>"}`.
pub(crate) fn error_response(status: StatusCode) -> Response {
    let message = status
        .canonical_reason()
        .unwrap_or("error")
        .to_ascii_lowercase();
    (status, Json(json!({ "message": message }))).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            debug!(error = %self, status = status.as_u16(), "Request denied");
        }
        error_response(status)
    }
}
