//! Chain assembly and shared state

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::authorize::authorize;
use super::callback::handle_callback;
use super::credential::AccessTokenValidator;
use super::middleware::{
    check_jwt, install_panic_hook, log_request, recover_panic, resolve_tenant,
};
use crate::idp::IdpClient;
use crate::policy::PolicyStore;
use crate::signer::Signer;
use crate::tenant::TenantRegistry;

/// Collaborators shared by every request
pub struct GatewayState {
    /// State-token signer
    pub signer: Arc<Signer>,
    /// Access-token validator (owns the JWKS cache)
    pub validator: AccessTokenValidator,
    /// Current policy snapshot
    pub policies: Arc<PolicyStore>,
    /// Hostname to tenant
    pub tenants: Arc<TenantRegistry>,
    /// IdP endpoints
    pub idp: IdpClient,
    /// Lifetime of minted state tokens
    pub state_ttl: Duration,
    /// Deny instead of challenging
    pub deny_on_failure: bool,
}

/// Build the admission router.
///
/// Every path falls through to the chain and ends in [`authorize`].
pub fn create_router(state: Arc<GatewayState>) -> Router {
    admission_chain(Router::new().fallback(authorize), state)
}

/// Wrap `routes` in the admission chain; layers are listed innermost first.
///
/// Also installs the panic hook whose stack [`recover_panic`] logs.
pub fn admission_chain(routes: Router<Arc<GatewayState>>, state: Arc<GatewayState>) -> Router {
    install_panic_hook();

    routes
        .layer(middleware::from_fn_with_state(Arc::clone(&state), check_jwt))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), handle_callback))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), resolve_tenant))
        .layer(CatchPanicLayer::custom(recover_panic))
        .layer(middleware::from_fn(log_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
