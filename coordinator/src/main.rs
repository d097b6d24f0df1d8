//! Coordinator service: HTTP API gateway for floor environment alerting.
//!
//! Accepts buildings, floors, thresholds and sensor readings over REST,
//! stores them in Postgres and runs every reading through the alert engine.
//!
//! # Configuration
//! Plain settings come from the environment (see [`settings`]). Secrets are
//! resolved via Bitwarden Secrets Manager (when `BWS_ACCESS_TOKEN` is set) or
//! plain environment variables.
//!
//! | Secret           | Fallback                                  |
//! |------------------|-------------------------------------------|
//! | `DATABASE_URL`   | assembled from the `POSTGRES_*` settings  |
//! | `GEMINI_API_KEY` | none: recommendations use the local table |

mod csv_import;
mod error;
mod handlers;
mod models;
mod router;
mod secrets;
mod settings;
mod state;

use std::sync::Arc;

use alert_engine::generator::GeminiGenerator;
use alert_engine::pg::PgStore;
use alert_engine::recommend::RecommendationComposer;
use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{secrets::SecretsClient, settings::Settings, state::AppState};

// ------------------------------------------------------------------ //
//  Entry point                                                        //
// ------------------------------------------------------------------ //

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coordinator=info".parse()?)
                .add_directive("alert_engine=info".parse()?),
        )
        .json()
        .init();

    let settings = Settings::load()?;
    let vault = SecretsClient::from_env();

    let database_url = match vault.resolve(&secrets::DATABASE_URL).await {
        Some(url) => url,
        None => {
            info!(host = %settings.postgres_host, db = %settings.postgres_db, "DATABASE_URL not set, using POSTGRES_* settings");
            settings.composed_database_url()
        }
    };

    let store = PgStore::connect(&database_url, settings.db_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    store.migrate().await.context("failed to apply schema")?;
    info!("Postgres pool connected");

    let composer = build_composer(&settings, &vault).await;
    info!(generator_enabled = composer.generator_enabled(), "recommendation composer ready");

    let state = Arc::new(AppState::new(Arc::new(store), settings.engine_config(), composer));
    let app = router::build(state);

    let listener = tokio::net::TcpListener::bind(&settings.coordinator_addr).await?;
    info!(addr = %settings.coordinator_addr, "coordinator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("coordinator stopped");
    Ok(())
}

/// Gemini-backed composer when an API key is available, else local table only.
async fn build_composer(settings: &Settings, vault: &SecretsClient) -> RecommendationComposer {
    let Some(api_key) = vault.resolve(&secrets::GEMINI_API_KEY).await else {
        warn!("GEMINI_API_KEY not configured, using predefined recommendations");
        return RecommendationComposer::fallback_only();
    };

    match GeminiGenerator::new(&settings.gemini_api_url, &api_key, &settings.gemini_model) {
        Ok(generator) => {
            info!(model = %settings.gemini_model, "Gemini generator configured");
            RecommendationComposer::with_generator(Arc::new(generator), settings.generator_timeout())
        }
        Err(e) => {
            warn!(error = %e, "could not build Gemini client, using predefined recommendations");
            RecommendationComposer::fallback_only()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
