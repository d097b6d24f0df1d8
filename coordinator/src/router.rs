use std::sync::Arc;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{handlers, state::AppState};

pub fn build(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/buildings", get(handlers::list_buildings).post(handlers::create_building))
        .route("/floors", get(handlers::list_floors).post(handlers::create_floor))
        .route("/floors/:id", delete(handlers::delete_floor))
        .route("/floors/:id/status", get(handlers::floor_status))
        .route("/thresholds", get(handlers::list_thresholds).post(handlers::create_threshold))
        .route("/metrics", get(handlers::list_metrics).post(handlers::ingest_metrics))
        .route("/metrics/csv", post(handlers::ingest_csv))
        .route("/alerts", get(handlers::list_alerts))
        .route("/alerts/:id", get(handlers::get_alert))
        .route("/alerts/:id/status", patch(handlers::update_alert_status));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
