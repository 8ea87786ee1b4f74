//! Identity provider client: authorization URL and code exchange.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::tenant::Tenant;
use crate::{Error, Result};

/// Token endpoint path relative to the IdP base URL.
pub const TOKEN_PATH: &str = "/oauth/token";
/// Authorization endpoint path relative to the IdP base URL.
pub const AUTHORIZE_PATH: &str = "/authorize";

/// Code exchange failures.
#[derive(Debug, thiserror::Error)]
pub enum IdpError {
    /// Connect, timeout or body read failure.
    #[error("token request failed: {0}")]
    Transport(String),

    /// The IdP answered with HTTP >= 400.
    #[error("token exchange refused: HTTP {status} - {body}")]
    Refused {
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// 2xx response that is not a token response.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

impl From<IdpError> for Error {
    fn from(e: IdpError) -> Self {
        match e {
            IdpError::Refused { status, body } => Self::UpstreamRefused { status, body },
            other => Self::UpstreamUnavailable(other.to_string()),
        }
    }
}

/// JSON body of `POST /oauth/token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// Always `authorization_code`
    pub grant_type: String,
    /// Tenant client id
    pub client_id: String,
    /// Code from the callback
    pub code: String,
    /// Callback URL the code was issued for
    pub redirect_uri: String,
    /// Tenant client secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Tenant audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl AuthorizationRequest {
    /// Exchange request for `code` on behalf of `tenant`.
    #[must_use]
    pub fn for_tenant(tenant: &Tenant, code: &str) -> Self {
        Self {
            grant_type: "authorization_code".to_string(),
            client_id: tenant.client_id.clone(),
            code: code.to_string(),
            redirect_uri: tenant.callback_url.clone(),
            client_secret: tenant.client_secret.clone(),
            audience: Some(tenant.audience.clone()).filter(|a| !a.is_empty()),
        }
    }
}

/// Token endpoint response.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    /// Access token, set verbatim as the cookie value
    pub access_token: String,
    /// OIDC id token
    #[serde(default)]
    pub id_token: String,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: String,
    /// Refresh token, if granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: i64,
}

impl std::fmt::Debug for AuthorizationResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// HTTP client for the IdP endpoints.
#[derive(Debug, Clone)]
pub struct IdpClient {
    base_url: String,
    http: reqwest::Client,
}

impl IdpClient {
    /// Client for the IdP at `base_url` with an outbound `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// IdP base URL (no trailing slash).
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Authorization URL that starts the code flow for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is not a valid URL.
    pub fn authorize_url(&self, tenant: &Tenant, state: &str, scopes: &[String]) -> Result<String> {
        let mut url = Url::parse(&format!("{}{AUTHORIZE_PATH}", self.base_url))
            .map_err(|e| Error::Config(format!("invalid auth domain '{}': {e}", self.base_url)))?;
        url.query_pairs_mut()
            .append_pair("audience", &tenant.audience)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &tenant.callback_url)
            .append_pair("client_id", &tenant.client_id)
            .append_pair("state", state)
            .append_pair("scope", &scopes.join(" "));
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        request: &AuthorizationRequest,
    ) -> std::result::Result<AuthorizationResponse, IdpError> {
        let token_url = format!("{}{TOKEN_PATH}", self.base_url);
        debug!(url = %token_url, client_id = %request.client_id, "Exchanging authorization code");

        let response = self
            .http
            .post(&token_url)
            .json(request)
            .send()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(IdpError::Refused {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| IdpError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| IdpError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{Json, Router, http::StatusCode, routing::post};
    use parking_lot::Mutex;

    fn tenant() -> Tenant {
        Tenant {
            hostname: "app.example.com".into(),
            client_id: "123".into(),
            client_secret: Some("s3cret".into()),
            audience: "friends".into(),
            callback_url: "https://app.example.com/callback".into(),
            tls: true,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn authorize_url_carries_all_parameters() {
        let client = IdpClient::new("https://test.url", Duration::from_secs(1)).unwrap();
        let url = client
            .authorize_url(&tenant(), "the-state", &["read".into(), "write".into()])
            .unwrap();

        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("test.url"));
        assert_eq!(parsed.path(), "/authorize");
        let query: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(query["audience"], "friends");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["redirect_uri"], "https://app.example.com/callback");
        assert_eq!(query["client_id"], "123");
        assert_eq!(query["state"], "the-state");
        assert_eq!(query["scope"], "read write");
    }

    #[test]
    fn request_omits_absent_secret() {
        let mut t = tenant();
        t.client_secret = None;
        let body = serde_json::to_value(AuthorizationRequest::for_tenant(&t, "abc")).unwrap();
        assert_eq!(body["grant_type"], "authorization_code");
        assert_eq!(body["code"], "abc");
        assert!(body.get("client_secret").is_none());
    }

    #[tokio::test]
    async fn exchange_posts_json_and_parses_response() {
        let seen = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&seen);
        let app = Router::new().route(
            TOKEN_PATH,
            post(move |Json(body): Json<AuthorizationRequest>| {
                let captured = Arc::clone(&captured);
                async move {
                    *captured.lock() = Some(body);
                    Json(serde_json::json!({
                        "access_token": "mocked_token_123",
                        "token_type": "Bearer",
                        "expires_in": 120
                    }))
                }
            }),
        );
        let base = serve(app).await;
        let client = IdpClient::new(&base, Duration::from_secs(5)).unwrap();

        let response = client
            .exchange_code(&AuthorizationRequest::for_tenant(&tenant(), "authorize"))
            .await
            .unwrap();

        assert_eq!(response.access_token, "mocked_token_123");
        assert_eq!(response.expires_in, 120);
        assert_eq!(response.id_token, "");
        let body = seen.lock().clone().unwrap();
        assert_eq!(body.code, "authorize");
        assert_eq!(body.client_secret.as_deref(), Some("s3cret"));
        assert_eq!(body.audience.as_deref(), Some("friends"));
    }

    #[tokio::test]
    async fn error_status_is_refused_with_body() {
        let app = Router::new().route(
            TOKEN_PATH,
            post(|| async { (StatusCode::FORBIDDEN, r#"{"error":"access_denied"}"#) }),
        );
        let base = serve(app).await;
        let client = IdpClient::new(&base, Duration::from_secs(5)).unwrap();

        let err = client
            .exchange_code(&AuthorizationRequest::for_tenant(&tenant(), "x"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, IdpError::Refused { status: 403, ref body } if body.contains("access_denied"))
        );
        assert!(matches!(Error::from(err), Error::UpstreamRefused { status: 403, .. }));
    }

    #[tokio::test]
    async fn unreachable_idp_is_transport_error() {
        let client = IdpClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client
            .exchange_code(&AuthorizationRequest::for_tenant(&tenant(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::Transport(_)));
    }
}
