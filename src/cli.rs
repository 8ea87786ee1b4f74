//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Sidecar authorization gateway - OAuth2 challenge and JWT admission per host/path policy
#[derive(Parser, Debug)]
#[command(name = "authz-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTHZ_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUTHZ_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "AUTHZ_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides `log.level`
    #[arg(long, env = "AUTHZ_GATEWAY_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json); overrides `log.format`
    #[arg(long, env = "AUTHZ_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Resource file (tenants + policies) to watch
    #[arg(long, env = "AUTHZ_GATEWAY_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Answer 401 instead of redirecting when no valid credential is present
    #[arg(long)]
    pub deny_on_failure: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Generate an RSA keypair for signing state tokens
    Keygen {
        /// Where to write the PEM PKCS#1 private key
        #[arg(long)]
        private_key: PathBuf,

        /// Where to write the PEM PKIX public key
        #[arg(long)]
        public_key: PathBuf,
    },

    /// Decode a resource file and report what it contains
    CheckPolicy {
        /// Resource file (YAML with `tenants:` / `policies:`)
        #[arg(required = true)]
        file: PathBuf,

        /// Reject unknown fields
        #[arg(long)]
        strict: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["authz-gateway", "--port", "9000"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.log_level, None);
        assert!(!cli.deny_on_failure);
    }

    #[test]
    fn log_flags_are_global() {
        let cli = Cli::parse_from([
            "authz-gateway",
            "check-policy",
            "r.yaml",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }

    #[test]
    fn parses_keygen() {
        let cli = Cli::parse_from([
            "authz-gateway",
            "keygen",
            "--private-key",
            "k.pem",
            "--public-key",
            "k.pub",
        ]);
        let Some(Command::Keygen { private_key, public_key }) = cli.command else {
            panic!("expected keygen");
        };
        assert_eq!(private_key, PathBuf::from("k.pem"));
        assert_eq!(public_key, PathBuf::from("k.pub"));
    }

    #[test]
    fn parses_check_policy() {
        let cli = Cli::parse_from(["authz-gateway", "check-policy", "--strict", "r.yaml"]);
        assert!(matches!(
            cli.command,
            Some(Command::CheckPolicy { ref file, strict: true }) if file == &PathBuf::from("r.yaml")
        ));
    }
}
