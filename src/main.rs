// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! `inference-muxd`: the server binary. Loads a TOML configuration,
//! constructs the Model Store / Instance Pool / Task Executor, starts the
//! HTTP façade, and shuts down cleanly on SIGINT/SIGTERM.
//!
//! Grounded on the teacher's `main.rs`: `tracing_subscriber::fmt::init()`
//! plus environment-driven bootstrap, replaced here with a `clap` CLI
//! pointing at a config file, since the model registry is too structured
//! for a flat list of env vars.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use inference_mux::config::{init_logging, Configuration};
use inference_mux::engine::composite::CompositeEngine;
use inference_mux::engine::echo::EchoEngine;
use inference_mux::engine::llama::LlamaEngine;
use inference_mux::engine::EngineRegistry;
use inference_mux::Server;

#[derive(Parser, Debug)]
#[command(name = "inference-muxd", version)]
struct Cli {
    /// Path to the TOML configuration file describing the model registry.
    #[arg(short, long, env = "INFERENCE_MUX_CONFIG", default_value = "inference-mux.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Configuration::load(&cli.config).await?
    } else {
        Configuration::default()
    };
    config.apply_env_overrides();

    init_logging(&config.log_level);

    tracing::info!(config = %cli.config.display(), listen_addr = %config.listen_addr, "starting inference-muxd");

    let mut engines = EngineRegistry::new();
    engines.register("llama-cpp", Arc::new(LlamaEngine));
    engines.register("composite", Arc::new(CompositeEngine));
    engines.register("echo", Arc::new(EchoEngine::default()));

    let specs = config.model_specs()?;
    let server = Server::new(
        specs,
        config.models_path.clone(),
        config.download_concurrency,
        config.concurrency,
        engines,
    )
    .await?;

    let app = inference_mux::http::router(server.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    server.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
