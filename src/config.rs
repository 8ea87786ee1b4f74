//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix (`AUTHZ_GATEWAY_AUTH__AUTH_DOMAIN=...`)
pub const ENV_PREFIX: &str = "AUTHZ_GATEWAY_";

/// Main configuration
///
/// Frozen after [`Config::load`] + CLI overrides; the gateway only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Log level and format
    pub log: LogConfig,
    /// IdP and fallback tenant configuration
    pub auth: AuthConfig,
    /// Outbound HTTP configuration
    pub http: HttpConfig,
    /// Policy resource source
    pub policy: PolicySourceConfig,
    /// Tenants registered at startup
    pub tenants: Vec<TenantConfig>,
    /// Policy specs installed at startup (decoded with the same rules as
    /// watched resources)
    pub policies: Vec<serde_json::Value>,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Log level and format; `--log-level`/`--log-format` override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive (`info`, `authz_gateway=debug`)
    pub level: String,
    /// `text` or `json`
    pub format: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// IdP and fallback tenant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// IdP hostname (`idp.example.com`) or base URL (`http://127.0.0.1:9000`)
    pub auth_domain: String,
    /// Expected `iss` claim; defaults to `<base url>/`
    pub issuer: Option<String>,
    /// Fallback tenant audience
    pub audience: String,
    /// Fallback tenant client id
    pub client_id: String,
    /// Fallback tenant client secret
    pub client_secret: Option<String>,
    /// Fallback tenant callback URL
    pub callback_url: String,
    /// PEM PKCS#1 private key; generated at boot when unset
    pub private_key_path: Option<PathBuf>,
    /// PEM PKIX public key; generated at boot when unset
    pub public_key_path: Option<PathBuf>,
    /// Lifetime of state tokens
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// Answer 401 instead of challenging when no valid credential is present
    pub deny_on_failure: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_domain: String::new(),
            issuer: None,
            audience: String::new(),
            client_id: String::new(),
            client_secret: None,
            callback_url: String::new(),
            private_key_path: None,
            public_key_path: None,
            state_ttl: Duration::from_secs(5 * 60),
            deny_on_failure: false,
        }
    }
}

impl AuthConfig {
    /// Base URL of the IdP, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        let domain = self.auth_domain.trim().trim_end_matches('/');
        if domain.contains("://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        }
    }

    /// Issuer URL expected in the `iss` claim of access tokens.
    #[must_use]
    pub fn issuer_url(&self) -> String {
        match self.issuer.as_deref() {
            Some(iss) if !iss.is_empty() => iss.to_string(),
            _ => format!("{}/", self.base_url()),
        }
    }

    /// Tenant used when the request hostname matches no registered tenant.
    #[must_use]
    pub fn fallback_tenant(&self) -> Option<TenantConfig> {
        if self.client_id.is_empty() {
            return None;
        }
        Some(TenantConfig {
            hostname: String::new(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone().filter(|s| !s.is_empty()),
            audience: self.audience.clone(),
            callback_url: self.callback_url.clone(),
            tls: None,
        })
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Timeout applied to JWKS fetches and token exchanges
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Policy resource source
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicySourceConfig {
    /// Resource file (YAML `tenants:` / `policies:`) watched for changes
    pub file: Option<PathBuf>,
    /// Reject unknown fields in policy specs
    pub strict: bool,
}

/// Tenant as written in configuration or resource files
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TenantConfig {
    /// Hostname the tenant serves (registry key)
    pub hostname: String,
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret (absent for public clients)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Audience requested from the IdP and expected in access tokens
    pub audience: String,
    /// Redirect URI registered with the IdP
    pub callback_url: String,
    /// Secure cookie flag; derived from the callback URL scheme when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<bool>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check the options the gateway cannot start without.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.auth.auth_domain.trim().is_empty() {
            return Err(Error::Config("auth.auth_domain is required".to_string()));
        }
        if !self.auth.client_id.is_empty() && self.auth.callback_url.is_empty() {
            return Err(Error::Config(
                "auth.callback_url is required when auth.client_id is set".to_string(),
            ));
        }
        if self.auth.private_key_path.is_some() != self.auth.public_key_path.is_some() {
            tracing::warn!(
                "Only one of auth.private_key_path/auth.public_key_path is set; a keypair will be generated"
            );
        }
        if self.auth.state_ttl < Duration::from_secs(1) {
            return Err(Error::Config(
                "auth.state_ttl must be at least 1s".to_string(),
            ));
        }
        for tenant in &self.tenants {
            if tenant.hostname.is_empty() {
                return Err(Error::Config(format!(
                    "tenant with client_id '{}' has no hostname",
                    tenant.client_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn auth(domain: &str) -> AuthConfig {
        AuthConfig {
            auth_domain: domain.to_string(),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn bare_domain_becomes_https_base_url() {
        assert_eq!(auth("test.url").base_url(), "https://test.url");
        assert_eq!(auth("test.url/").base_url(), "https://test.url");
    }

    #[test]
    fn full_url_domain_is_kept() {
        assert_eq!(
            auth("http://127.0.0.1:9000/").base_url(),
            "http://127.0.0.1:9000"
        );
    }

    #[test]
    fn issuer_defaults_to_base_with_trailing_slash() {
        assert_eq!(auth("idp.example.com").issuer_url(), "https://idp.example.com/");

        let mut explicit = auth("idp.example.com");
        explicit.issuer = Some("https://issuer.example.com".to_string());
        assert_eq!(explicit.issuer_url(), "https://issuer.example.com");
    }

    #[test]
    fn fallback_tenant_requires_client_id() {
        assert!(auth("test.url").fallback_tenant().is_none());

        let mut cfg = auth("test.url");
        cfg.client_id = "123".to_string();
        cfg.audience = "friends".to_string();
        cfg.callback_url = "test.url/callback".to_string();
        cfg.client_secret = Some(String::new());

        let tenant = cfg.fallback_tenant().unwrap();
        assert_eq!(tenant.client_id, "123");
        assert_eq!(tenant.audience, "friends");
        // empty secret from the environment means "no secret"
        assert_eq!(tenant.client_secret, None);
    }

    #[test]
    fn validate_requires_auth_domain() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("auth_domain"));
    }

    #[test]
    fn validate_requires_callback_for_fallback_tenant() {
        let mut config = Config::default();
        config.auth.auth_domain = "test.url".to_string();
        config.auth.client_id = "123".to_string();
        assert!(config.validate().is_err());

        config.auth.callback_url = "test.url/callback".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_sub_second_state_ttl() {
        let mut config = Config::default();
        config.auth.auth_domain = "test.url".to_string();
        config.auth.state_ttl = Duration::from_millis(500);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("state_ttl"));

        config.auth.state_ttl = Duration::from_secs(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, None);
        assert_eq!(config.auth.state_ttl, Duration::from_secs(300));
        assert_eq!(config.http.timeout, Duration::from_secs(10));
        assert_eq!(config.server.port, 8080);
        assert!(!config.auth.deny_on_failure);
        assert!(!config.policy.strict);
    }

    #[test]
    fn load_reads_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  port: 9999
log:
  level: authz_gateway=debug
  format: json
auth:
  auth_domain: idp.example.com
  audience: friends
  client_id: "123"
  callback_url: https://app.example.com/callback
  state_ttl: 2m
tenants:
  - hostname: app.example.com
    client_id: abc
    audience: api
    callback_url: https://app.example.com/callback
policies:
  - name: default
    rules:
      - host: "*"
        path: "/public/*"
        public: true
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.log.level, "authz_gateway=debug");
        assert_eq!(config.log.format.as_deref(), Some("json"));
        assert_eq!(config.auth.auth_domain, "idp.example.com");
        assert_eq!(config.auth.state_ttl, Duration::from_secs(120));
        assert_eq!(config.tenants.len(), 1);
        assert_eq!(config.tenants[0].hostname, "app.example.com");
        assert_eq!(config.policies.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
