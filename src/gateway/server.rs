//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use super::credential::AccessTokenValidator;
use super::router::{GatewayState, create_router};
use crate::config::Config;
use crate::idp::IdpClient;
use crate::jwks::JwksCache;
use crate::policy::PolicyStore;
use crate::signer::Signer;
use crate::tenant::{Tenant, TenantRegistry};
use crate::watcher::{FileSource, ResourceWatcher, decode_specs};
use crate::{Error, Result};

/// Authorization gateway server
pub struct Gateway {
    config: Config,
    state: Arc<GatewayState>,
}

impl Gateway {
    /// Build every collaborator from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid configuration or static policies
    /// and [`Error::KeyMaterial`] if the signing keys cannot be set up.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let signer = Signer::load_or_generate(
            config.auth.private_key_path.as_deref(),
            config.auth.public_key_path.as_deref(),
        )?;
        Self::with_signer(config, Arc::new(signer))
    }

    /// Build with an existing signer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid configuration or static policies.
    pub fn with_signer(config: Config, signer: Arc<Signer>) -> Result<Self> {
        config.validate()?;

        let base_url = config.auth.base_url();
        let jwks = Arc::new(JwksCache::new(&base_url, config.http.timeout)?);
        let idp = IdpClient::new(&base_url, config.http.timeout)?;

        let policies = Arc::new(PolicyStore::new());
        let specs = decode_specs("config", &config.policies, config.policy.strict)?;
        policies.replace_specs(specs);

        let tenants = Arc::new(TenantRegistry::new(
            config.tenants.iter().map(Tenant::from_config).collect(),
            config.auth.fallback_tenant().as_ref().map(Tenant::from_config),
        ));

        let state = Arc::new(GatewayState {
            signer,
            validator: AccessTokenValidator::new(jwks, config.auth.issuer_url()),
            policies,
            tenants,
            idp,
            state_ttl: config.auth.state_ttl,
            deny_on_failure: config.auth.deny_on_failure,
        });

        Ok(Self { config, state })
    }

    /// Shared state (stores, signer, clients).
    #[must_use]
    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    /// The admission router, ready to serve or drive in tests.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the gateway until Ctrl-C / SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the resource file
    /// cannot be watched.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let _file_source = match &self.config.policy.file {
            Some(path) => {
                let (tx, rx) = mpsc::channel(16);
                ResourceWatcher::spawn(
                    Arc::clone(&self.state.policies),
                    Arc::clone(&self.state.tenants),
                    rx,
                    shutdown_tx.subscribe(),
                );
                let source = FileSource::start(
                    path.clone(),
                    self.config.policy.strict,
                    tx,
                    shutdown_tx.subscribe(),
                )?;
                info!(path = %path.display(), strict = self.config.policy.strict, "Watching resource file");
                Some(source)
            }
            None => None,
        };

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        let snapshot = self.state.policies.snapshot();
        info!("============================================================");
        info!("AUTHZ GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(idp = %self.state.idp.base_url(), issuer = %self.state.validator.issuer(), "Identity provider");
        info!(
            tenants = self.state.tenants.len(),
            fallback = !self.config.auth.client_id.is_empty(),
            rules = snapshot.len(),
            "Admission state"
        );
        if self.config.auth.deny_on_failure {
            info!("DENY ON FAILURE enabled - requests without a credential get 401");
        }
        if snapshot.is_empty() && self.config.policy.file.is_none() {
            warn!("No policy rules configured - every request will be challenged");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
