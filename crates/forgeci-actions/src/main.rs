// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forgeci Actions server binary.
//!
//! Runs the full engine standalone: the QUIC runner service, the OIDC HTTP
//! surface, and the background sweepers over a SQLite database. Embedders
//! that already have a forge wire the library crate in directly instead.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};

use forgeci_actions::config::Config;
use forgeci_actions::dispatcher::Dispatcher;
use forgeci_actions::http::{self, HttpState};
use forgeci_actions::lifecycle::{Lifecycle, NoopStatusHook};
use forgeci_actions::logstore::FsLogStore;
use forgeci_actions::migrations;
use forgeci_actions::oidc::IdTokenSigner;
use forgeci_actions::persistence::SqlitePersistence;
use forgeci_actions::registry::{AllScopesValid, RunnerRegistry};
use forgeci_actions::runs::RunManager;
use forgeci_actions::secrets::SecretStore;
use forgeci_actions::server::RunnerService;
use forgeci_actions::sweeper::Sweeper;
use forgeci_actions::token::TokenService;
use forgeci_actions::workflow::expand::NoFetcher;
use forgeci_protocol::server::ForgeServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forgeci_actions=info".parse().unwrap()),
        )
        .init();

    info!("Starting Forgeci Actions");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        quic_addr = %config.quic_addr,
        http_addr = %config.http_addr,
        oidc_alg = %config.oidc_alg,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Running database migrations...");
    migrations::run_sqlite(&pool).await?;
    info!("Migrations completed");

    let db = Arc::new(SqlitePersistence::new(pool.clone()));
    let logs = Arc::new(FsLogStore::new(&config.log_dir));
    let signer = Arc::new(IdTokenSigner::load_or_generate(
        &config.oidc_alg,
        Path::new(&config.oidc_key_file),
        config.issuer(),
    )?);
    let tokens = TokenService::new(config.runtime_secret.clone());
    let secrets = SecretStore::new(db.clone(), config.runtime_secret.clone());

    let registry = Arc::new(RunnerRegistry::new(
        db.clone(),
        logs.clone(),
        Arc::new(AllScopesValid),
    ));
    let runs = Arc::new(RunManager::new(db.clone(), Arc::new(NoFetcher)));
    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        secrets,
        tokens.clone(),
        config.issuer(),
    ));
    let lifecycle = Arc::new(Lifecycle::new(
        db.clone(),
        logs.clone(),
        runs.clone(),
        Arc::new(NoopStatusHook),
        config.concurrency_enabled,
    ));

    info!("Forgeci Actions initialized successfully");

    // QUIC runner service with a self-signed certificate; runners are
    // configured to trust it explicitly.
    let quic_server = ForgeServer::localhost(config.quic_addr)?;
    let service = Arc::new(RunnerService::new(registry, dispatcher, lifecycle.clone()));
    let quic_handle = tokio::spawn(async move {
        service.serve(quic_server).await;
    });

    // OIDC HTTP surface.
    let http_state = HttpState {
        db: db.clone(),
        tokens,
        signer,
        app_url: config.app_url.trim_end_matches('/').to_string(),
    };
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, http::router(http_state)).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Background repair loops.
    let sweeper = Sweeper::new(
        db,
        logs,
        runs,
        config.sweep_interval_secs,
        config.zombie_task_timeout_secs,
        config.abandoned_job_timeout_secs,
        config.log_flush_timeout_secs,
    );
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run().await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    quic_handle.abort();
    http_handle.abort();
    sweeper_handle.abort();

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
