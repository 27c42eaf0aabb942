//! AgentHub AICP - Agent Identity & Authorization Control Plane

use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use agenthub_aicp::api::server::{AppState, serve};
use agenthub_aicp::cli::{Cli, Command};
use agenthub_aicp::config::{AccessMode, Config};
use agenthub_aicp::diagnostics::build_startup_diagnostics;
use agenthub_aicp::secrets::SigningSecrets;
use agenthub_aicp::setup_tracing;

fn check_readiness(config: &Config) -> ExitCode {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let report = build_startup_diagnostics(&env, config.access_mode);
    let ready = report.startup_ready;
    match serde_json::to_string_pretty(&report) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => {
            eprintln!("failed to render readiness report: {e}");
            return ExitCode::from(2);
        }
    }
    if ready { ExitCode::SUCCESS } else { ExitCode::from(2) }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if matches!(cli.command, Some(Command::CheckReadiness)) {
        return check_readiness(&config);
    }

    // Fail closed: in enforce mode a critical readiness failure refuses
    // startup entirely.
    if config.access_mode == AccessMode::Enforce {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let report = build_startup_diagnostics(&env, config.access_mode);
        if !report.startup_ready {
            error!(
                missing_or_invalid = ?report.missing_or_invalid,
                "Startup diagnostics failed in enforce mode; refusing to serve"
            );
            return ExitCode::FAILURE;
        }
    }

    let secrets = match SigningSecrets::from_process_env() {
        Ok(secrets) => secrets,
        Err(e) => {
            error!("Failed to load signing secrets: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %cli.host,
        port = cli.port,
        mode = config.access_mode.as_str(),
        "Starting AICP control plane"
    );

    let state = match AppState::from_config(config, secrets) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to open stores: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = serve(state, &cli.host, cli.port).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Control plane shutdown complete");
    ExitCode::SUCCESS
}
