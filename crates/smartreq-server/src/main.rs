// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Smart Request Server
//!
//! Loads configuration, connects to PostgreSQL or SQLite (picked from the
//! URL scheme), runs migrations and serves the HTTP API until Ctrl-C.

use std::sync::Arc;

use tracing::{info, warn};

use smartreq_core::config::Config;
use smartreq_core::handlers::HandlerState;
use smartreq_core::migrations;
use smartreq_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn Persistence>> {
    if config.is_sqlite() {
        let options: sqlx::sqlite::SqliteConnectOptions = config.database_url.parse()?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(
                options
                    .create_if_missing(true)
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
            )
            .await?;
        migrations::run_sqlite(&pool).await?;
        info!(backend = "sqlite", "Connected to database");
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        info!(backend = "postgres", "Connected to database");
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartreq_server=info,smartreq_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        sequence_scope = ?config.sequence_scope,
        max_connections = config.max_connections,
        "Starting Smart Request server"
    );

    let persistence = connect(&config).await?;
    let state = HandlerState::new(persistence).with_sequence_scope(config.sequence_scope);
    let app = smartreq_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "HTTP server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    info!("Smart Request server shut down");

    Ok(())
}
