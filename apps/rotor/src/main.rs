use std::error::Error;
use std::sync::Arc;

use clap::Parser;
mod cli;
use rotor_common::SettingsPatch;
use rotor_core::{Dispatcher, UpstreamClient};
use rotor_pool::{CredentialPool, CredentialStore, FileStore, PoolConfig, TokenRefresher, TokenSource};
use rotor_router::{AppState, build_router};
use tracing::info;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("rotor failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let mut patch = SettingsPatch::from_env();
    patch.overlay(cli.into_patch());
    let settings = patch.into_settings();
    info!(
        host = %settings.host,
        port = settings.port,
        credentials_dir = %settings.credentials_dir,
        calls_per_rotation = settings.calls_per_rotation,
        "settings loaded"
    );

    let store: Arc<dyn CredentialStore> = Arc::new(FileStore::new(&settings.credentials_dir));
    let tokens: Arc<dyn TokenSource> = Arc::new(TokenRefresher::new()?);
    let pool = Arc::new(
        CredentialPool::load(
            store,
            tokens,
            PoolConfig {
                calls_per_rotation: settings.calls_per_rotation,
                auto_ban: settings.auto_ban,
                auto_ban_error_codes: settings.auto_ban_error_codes.clone(),
                auto_ban_threshold: settings.auto_ban_threshold,
            },
        )
        .await?,
    );
    if pool.is_empty() {
        tracing::warn!(dir = %settings.credentials_dir, "no credentials found, every request will fail");
    }

    let upstream = Arc::new(UpstreamClient::new(&settings)?);
    let dispatcher = Arc::new(Dispatcher::new(pool, upstream, settings.clone()));

    let app = build_router(AppState {
        dispatcher,
        settings: settings.clone(),
    });

    let bind = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rotor=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
