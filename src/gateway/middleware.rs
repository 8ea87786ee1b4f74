//! Chain stages: request log, panic recovery, tenant resolver, JWT check.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic;
use std::sync::{Arc, Once};
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, error, info};

use super::authorize::admit;
use super::credential::extract_credential;
use super::router::GatewayState;
use super::{MatchedRule, OriginalUrl, error_response};
use crate::Error;
use crate::tenant::Tenant;

/// Upper bound on panic text and stack written to the log.
const PANIC_LOG_LIMIT: usize = 8 * 1024;

thread_local! {
    /// Stack of the last panic on this thread, taken by [`recover_panic`].
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a process panic hook that records the panicking thread's stack.
///
/// `CatchPanicLayer` only sees the payload once unwinding is over, so the
/// stack has to be captured here. The previous hook still runs. Idempotent.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Log method, path and resulting status of every request.
pub async fn log_request(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "request"
    );
    response
}

/// Panic handler for `CatchPanicLayer`: log the message and stack (each
/// bounded), answer 500.
pub fn recover_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };

    let stack = PANIC_STACK
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default();

    error!(
        panic = %truncate(message, PANIC_LOG_LIMIT),
        stack = %truncate(&stack, PANIC_LOG_LIMIT),
        "Request handler panicked"
    );
    error_response(StatusCode::INTERNAL_SERVER_ERROR)
}

fn truncate(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `Host` header, or the URI authority for absolute-form requests.
pub fn request_host(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(axum::http::uri::Authority::as_str))
        .filter(|h| !h.is_empty())
}

/// `scheme://host/path[?query]`, scheme from `X-Forwarded-Proto`.
pub fn original_url(request: &Request<Body>) -> Option<String> {
    let host = request_host(request)?;
    let scheme = request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("http");

    let uri = request.uri();
    let mut url = format!("{scheme}://{host}{}", uri.path());
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    Some(url)
}

/// Attach the tenant for the request hostname, or deny with 401.
pub async fn resolve_tenant(
    State(state): State<Arc<GatewayState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    let url = original_url(&request)
        .ok_or_else(|| Error::Unauthorized("request without a host".into()))?;
    let tenant = request_host(&request)
        .and_then(|h| state.tenants.find_tenant(h))
        .ok_or_else(|| Error::Unauthorized(format!("no tenant for {url}")))?;

    request.extensions_mut().insert(tenant);
    request.extensions_mut().insert(OriginalUrl(url));
    Ok(next.run(request).await)
}

/// Match the policy rule, then admit on a valid credential or forward.
///
/// An absent or invalid credential never denies here: the request may be for
/// a public path.
pub async fn check_jwt(
    State(state): State<Arc<GatewayState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let host = request_host(&request).unwrap_or_default().to_string();
    let path = request.uri().path().to_string();

    let rule = state.policies.snapshot().find(&host, &path);
    request.extensions_mut().insert(MatchedRule(rule.clone()));

    let Some(tenant) = request.extensions().get::<Arc<Tenant>>().cloned() else {
        return Error::Internal("JWT check reached without a resolved tenant".into())
            .into_response();
    };

    if let Some(credential) = extract_credential(request.headers()) {
        match state
            .validator
            .validate(&credential.token, &tenant.audience, rule.as_deref())
            .await
        {
            Ok(claims) => {
                debug!(
                    path = %path,
                    sub = claims.get("sub").and_then(|v| v.as_str()).unwrap_or_default(),
                    source = ?credential.source,
                    "Credential accepted"
                );
                return admit(credential.authorization());
            }
            Err(e) => {
                debug!(path = %path, source = ?credential.source, error = %e, "Credential rejected");
            }
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn original_url_defaults_to_http() {
        let req = request("/foo?bar=1", &[("host", "app.example.com")]);
        assert_eq!(
            original_url(&req).as_deref(),
            Some("http://app.example.com/foo?bar=1")
        );
    }

    #[test]
    fn original_url_honours_forwarded_proto_and_drops_empty_query() {
        let req = request(
            "/foo?",
            &[("host", "app.example.com:8443"), ("x-forwarded-proto", "https, http")],
        );
        assert_eq!(
            original_url(&req).as_deref(),
            Some("https://app.example.com:8443/foo")
        );
    }

    #[test]
    fn original_url_uses_absolute_form_authority() {
        let req = request("http://proxy.example.com/x", &[]);
        assert_eq!(
            original_url(&req).as_deref(),
            Some("http://proxy.example.com/x")
        );
    }

    #[test]
    fn no_host_means_no_url() {
        assert!(original_url(&request("/x", &[])).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 100), "short");
    }

    #[tokio::test]
    async fn recovered_panic_is_json_500() {
        let response = recover_panic(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn panic_hook_records_stack_for_recovery() {
        install_panic_hook();
        install_panic_hook();

        let caught = panic::catch_unwind(|| panic!("boom"));
        assert!(caught.is_err());

        let stack = PANIC_STACK.with(|slot| slot.borrow().clone());
        assert!(stack.is_some_and(|s| !s.is_empty()));

        let response = recover_panic(caught.unwrap_err());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(PANIC_STACK.with(|slot| slot.borrow().is_none()));
    }
}
