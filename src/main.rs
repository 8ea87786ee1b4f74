//! Authorization Gateway - sidecar OAuth2/JWT admission

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use authz_gateway::{
    cli::{Cli, Command},
    config::{Config, LogConfig},
    gateway::Gateway,
    setup_tracing,
    signer::{KEY_BITS, Signer},
    watcher::{ResourceUpdate, load_resource_file},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Keygen {
            ref private_key,
            ref public_key,
        }) => {
            if !init_tracing(&cli, &LogConfig::default()) {
                return ExitCode::FAILURE;
            }
            run_keygen(private_key, public_key)
        }
        Some(Command::CheckPolicy { ref file, strict }) => {
            if !init_tracing(&cli, &LogConfig::default()) {
                return ExitCode::FAILURE;
            }
            run_check_policy(file, strict)
        }
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Install tracing; `--log-level`/`--log-format` win over the `log` section.
fn init_tracing(cli: &Cli, log: &LogConfig) -> bool {
    let level = cli.log_level.as_deref().unwrap_or(&log.level);
    let format = cli.log_format.as_deref().or(log.format.as_deref());
    match setup_tracing(level, format) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Failed to setup tracing: {e}");
            false
        }
    }
}

/// Generate and persist a signing keypair
fn run_keygen(private_key: &Path, public_key: &Path) -> ExitCode {
    let signer = match Signer::generate() {
        Ok(s) => s,
        Err(e) => {
            error!("Key generation failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = signer.write_pem_files(private_key, public_key) {
        error!("Failed to write keys: {e}");
        return ExitCode::FAILURE;
    }

    println!("Generated {KEY_BITS}-bit RSA keypair");
    println!("  private key: {}", private_key.display());
    println!("  public key:  {}", public_key.display());
    ExitCode::SUCCESS
}

/// Decode a resource file and print a summary
fn run_check_policy(file: &Path, strict: bool) -> ExitCode {
    match load_resource_file(file, strict) {
        Ok(updates) => {
            println!("✅ {} is valid", file.display());
            for update in updates {
                match update {
                    ResourceUpdate::Tenants(tenants) => {
                        println!("   Tenants: {}", tenants.len());
                        for t in &tenants {
                            println!("     {} (client_id={}, tls={})", t.hostname, t.client_id, t.tls);
                        }
                    }
                    ResourceUpdate::Policies(specs) => {
                        let rules: usize = specs.iter().map(|s| s.rules.len()).sum();
                        println!("   Policies: {} ({rules} rules)", specs.len());
                        for spec in &specs {
                            println!("     {}: {} rules", spec.name, spec.rules.len());
                        }
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {}: {e}", file.display());
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if let Some(ref file) = cli.policy_file {
                config.policy.file = Some(file.clone());
            }
            if cli.deny_on_failure {
                config.auth.deny_on_failure = true;
            }
            config
        }
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !init_tracing(&cli, &config.log) {
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        auth_domain = %config.auth.auth_domain,
        tenants = config.tenants.len(),
        "Starting authorization gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
