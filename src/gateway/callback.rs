//! IdP callback: state check, code exchange, cookie, redirect back.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use super::credential::ACCESS_TOKEN_COOKIE;
use super::router::GatewayState;
use crate::idp::AuthorizationRequest;
use crate::tenant::Tenant;
use crate::{Error, Result};

/// Path the IdP redirects back to.
pub const CALLBACK_PATH: &str = "/callback";

/// Callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// State token minted by the challenge
    pub state: Option<String>,
    /// Error code
    pub error: Option<String>,
    /// Error description
    pub error_description: Option<String>,
}

/// Terminal-handle `/callback`; forward everything else.
pub async fn handle_callback(
    State(state): State<Arc<GatewayState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() != CALLBACK_PATH {
        return next.run(request).await;
    }

    let Some(tenant) = request.extensions().get::<Arc<Tenant>>().cloned() else {
        return Error::Internal("callback reached without a resolved tenant".into()).into_response();
    };
    let params = match Query::<CallbackParams>::try_from_uri(request.uri()) {
        Ok(Query(params)) => params,
        Err(e) => return Error::Malformed(format!("callback query: {e}")).into_response(),
    };

    callback(&state, &tenant, params).await.into_response()
}

/// Redeem a callback for `tenant`.
///
/// # Errors
///
/// [`Error::Malformed`] (400) for a missing or invalid state token,
/// [`Error::Unauthorized`] (401) for an IdP error or a missing code, and the
/// upstream variants (401) when the code exchange fails.
pub async fn callback(
    state: &GatewayState,
    tenant: &Tenant,
    params: CallbackParams,
) -> Result<Response> {
    if let Some(err) = params.error.as_deref().filter(|e| !e.is_empty()) {
        warn!(
            error = %err,
            description = params.error_description.as_deref().unwrap_or_default(),
            client_id = %tenant.client_id,
            "IdP returned an error"
        );
        return Err(Error::Unauthorized(format!("IdP error: {err}")));
    }

    let state_token = params
        .state
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Malformed("callback without state".into()))?;
    let claims = state.signer.verify_state(state_token)?;

    let code = params
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Unauthorized("callback without code".into()))?;

    let request = AuthorizationRequest::for_tenant(tenant, code);
    let tokens = state
        .idp
        .exchange_code(&request)
        .await
        .inspect_err(|e| warn!(error = %e, client_id = %tenant.client_id, "Code exchange failed"))?;

    let expires_at = Utc::now()
        .checked_add_signed(TimeDelta::try_seconds(tokens.expires_in).unwrap_or_default())
        .unwrap_or_else(Utc::now);
    let cookie = access_token_cookie(&tokens.access_token, expires_at, tenant.tls);

    info!(
        client_id = %tenant.client_id,
        redirect = %claims.redirect_url,
        expires_in = tokens.expires_in,
        "Authorization code redeemed"
    );
    Ok((
        [(header::SET_COOKIE, cookie)],
        Redirect::temporary(&claims.redirect_url),
    )
        .into_response())
}

/// `Set-Cookie` value for the access token.
#[must_use]
pub fn access_token_cookie(token: &str, expires_at: DateTime<Utc>, secure: bool) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!(
        "{ACCESS_TOKEN_COOKIE}={token}; Path=/; Expires={}; HttpOnly{secure_flag}",
        expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}
