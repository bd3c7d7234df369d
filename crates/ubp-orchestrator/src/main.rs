// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! UBP Orchestrator daemon.
//!
//! Configuration comes from the environment (see `config`); flags override
//! it for local runs.
//!
//! # Usage
//!
//! ```bash
//! # Environment-driven
//! ADMIN_TOKEN=secret ubp-orchestrator
//!
//! # Local overrides
//! ADMIN_TOKEN=secret ubp-orchestrator --listen 127.0.0.1:7780 \
//!     --admin-listen 127.0.0.1:7781 --state-store sqlite://ubp.db
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 fatal runtime
//! error.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use ubp_orchestrator::server::ServerError;
use ubp_orchestrator::{Config, Orchestrator};

/// UBP Orchestrator - control plane for bot fleets
#[derive(Parser, Debug)]
#[command(name = "ubp-orchestrator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data-plane bind address (overrides LISTEN_ADDRESS)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Admin HTTP bind address (overrides ADMIN_LISTEN_ADDRESS)
    #[arg(long)]
    admin_listen: Option<SocketAddr>,

    /// State store URL, e.g. sqlite://ubp.db (overrides STATE_STORE_URL)
    #[arg(long)]
    state_store: Option<String>,

    /// Wire encoding: binary or json (overrides WIRE_ENCODING)
    #[arg(long)]
    encoding: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {}", e);
        return ExitCode::from(2);
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    info!("UBP Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!("data plane: {}", config.listen_address);
    info!("admin api:  {}", config.admin_listen_address);
    info!(
        "state:      {}",
        config.state_store_url.as_deref().unwrap_or("in-memory")
    );

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ (ServerError::Config(_) | ServerError::Store(_))) => {
            error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(2)
        }
    }
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = Config::from_env()?;
    if let Some(listen) = args.listen {
        config.listen_address = listen;
    }
    if let Some(admin) = args.admin_listen {
        config.admin_listen_address = admin;
    }
    if let Some(store) = &args.state_store {
        config.state_store_url = Some(store.clone());
    }
    if let Some(encoding) = &args.encoding {
        config.wire_encoding = encoding.parse()?;
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> Result<(), ServerError> {
    let orch = Orchestrator::new(config)?;

    let handle = orch.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received, draining sessions");
        handle.shutdown();
    });

    orch.run().await
}
