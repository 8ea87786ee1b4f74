//! Tenant registry: request hostname to OAuth2 client settings.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::config::TenantConfig;

/// Per-hostname OAuth2 client settings. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    /// Hostname served (lowercase, no port)
    pub hostname: String,
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret; `None` for public clients
    pub client_secret: Option<String>,
    /// Audience requested and expected in access tokens
    pub audience: String,
    /// Redirect URI registered with the IdP
    pub callback_url: String,
    /// Set `Secure` on the access-token cookie
    pub tls: bool,
}

impl Tenant {
    /// Build from configuration; `tls` defaults to the callback URL scheme.
    #[must_use]
    pub fn from_config(cfg: &TenantConfig) -> Self {
        let tls = cfg.tls.unwrap_or_else(|| {
            cfg.callback_url
                .get(..8)
                .is_some_and(|s| s.eq_ignore_ascii_case("https://"))
        });
        Self {
            hostname: cfg.hostname.trim().to_ascii_lowercase(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone().filter(|s| !s.is_empty()),
            audience: cfg.audience.clone(),
            callback_url: cfg.callback_url.clone(),
            tls,
        }
    }
}

/// Strip the port (and IPv6 brackets) from a `Host` value.
#[must_use]
pub fn hostname_of(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Read-mostly tenant map with an optional fallback tenant.
#[derive(Debug)]
pub struct TenantRegistry {
    tenants: ArcSwap<HashMap<String, Arc<Tenant>>>,
    fallback: Option<Arc<Tenant>>,
}

impl TenantRegistry {
    /// Registry seeded with `tenants`.
    #[must_use]
    pub fn new(tenants: Vec<Tenant>, fallback: Option<Tenant>) -> Self {
        Self {
            tenants: ArcSwap::from_pointee(index(tenants)),
            fallback: fallback.map(Arc::new),
        }
    }

    /// Tenant for a `Host` value: exact hostname first, then the fallback.
    #[must_use]
    pub fn find_tenant(&self, host: &str) -> Option<Arc<Tenant>> {
        let name = hostname_of(host).to_ascii_lowercase();
        self.tenants
            .load()
            .get(&name)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    /// Replace every registered tenant at once. The fallback is kept.
    pub fn replace(&self, tenants: Vec<Tenant>) {
        let map = index(tenants);
        debug!(tenants = map.len(), "Publishing tenant registry");
        self.tenants.store(Arc::new(map));
    }

    /// Number of registered tenants (fallback excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tenants.load().len()
    }

    /// No registered tenants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tenants.load().is_empty()
    }
}

fn index(tenants: Vec<Tenant>) -> HashMap<String, Arc<Tenant>> {
    tenants
        .into_iter()
        .map(|t| (t.hostname.clone(), Arc::new(t)))
        .collect()
}
