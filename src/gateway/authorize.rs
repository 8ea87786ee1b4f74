//! Authorize decision: the terminal stage for requests without a valid
//! credential.

use std::sync::Arc;

use axum::{
    Extension,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use tracing::debug;

use super::router::GatewayState;
use super::{MatchedRule, OriginalUrl};
use crate::tenant::Tenant;
use crate::{Error, Result};

/// 200 carrying the admitted `Authorization` header.
///
/// The response is built fresh, so request headers such as `Client-Secret`
/// are never echoed back.
pub fn admit(authorization: Option<HeaderValue>) -> Response {
    let mut response = StatusCode::OK.into_response();
    if let Some(value) = authorization {
        response.headers_mut().insert(header::AUTHORIZATION, value);
    }
    response
}

/// Public rule: admit. Otherwise challenge with a 303 to the IdP, or deny
/// with 401 when `deny_on_failure` is set.
pub async fn authorize(
    State(state): State<Arc<GatewayState>>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Extension(MatchedRule(rule)): Extension<MatchedRule>,
    Extension(OriginalUrl(original_url)): Extension<OriginalUrl>,
) -> Result<Response> {
    if rule.as_ref().is_some_and(|r| r.is_public()) {
        debug!(url = %original_url, "Public rule, admitting");
        return Ok(admit(None));
    }

    if state.deny_on_failure {
        return Err(Error::Unauthorized(format!(
            "no valid credential for {original_url}"
        )));
    }

    let state_token = state.signer.issue_state(&original_url, state.state_ttl)?;
    let scopes = rule.as_ref().map(|r| r.scopes()).unwrap_or_default();
    let location = state.idp.authorize_url(&tenant, &state_token, scopes)?;

    debug!(url = %original_url, client_id = %tenant.client_id, "Challenging");
    Ok(Redirect::to(&location).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_carries_authorization_only() {
        let response = admit(Some(HeaderValue::from_static("Bearer t")));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::AUTHORIZATION], "Bearer t");
        assert_eq!(response.headers().len(), 1);
    }

    #[test]
    fn bare_admit_has_no_authorization() {
        let response = admit(None);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::AUTHORIZATION).is_none());
    }
}
