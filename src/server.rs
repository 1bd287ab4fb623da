use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState};
use crate::db::{DbHandle, Store};
use crate::models::Role;

/// Runtime settings for the HTTP server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: std::path::PathBuf::from("tablero.db"),
            dev_mode: false,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// A fresh database has no one who could pass the user-admin gate, so
/// bootstrap an OWNER account on first start.
pub fn bootstrap_owner(db: &DbHandle) -> Result<()> {
    let store = db
        .lock_sync()
        .map_err(|e| anyhow::anyhow!("store unavailable: {}", e))?;
    if store.list_users()?.is_empty() {
        let owner = store.create_user("Administrator", "admin@local", &[Role::Owner])?;
        tracing::info!(user_id = owner.id, "bootstrapped initial OWNER account");
    }
    Ok(())
}

pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let store = Store::open(&config.db_path).context("Failed to initialize database")?;
    let db = DbHandle::new(store);
    bootstrap_owner(&db)?;

    let state = Arc::new(AppState { db });
    let mut app = build_router(state);

    if config.dev_mode {
        // Browser clients on another origin during development.
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "tablero listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutting down");
}
