//! Axum HTTP handlers for the coordinator service.

use std::collections::HashMap;
use std::sync::Arc;

use alert_engine::model::{AlertFilter, NewBuilding, NewFloor, NewThreshold};
use alert_engine::store::{Conflict, Store};
use alert_engine::{Floor, Measurement};
use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{error, info, warn};

use crate::{
    csv_import,
    error::{ApiError, ApiResult},
    models::{IngestItem, IngestPayload, IngestResponse, MetricsQuery, StatusUpdate},
    state::AppState,
};

const MAX_BUILDING_NAME: usize = 150;
const MAX_BUILDING_ADDRESS: usize = 200;
const MAX_FLOOR_NAME: usize = 100;

fn check_text(field: &str, value: &str, max: usize) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(ApiError::BadRequest(format!("{field} exceeds {max} characters")));
    }
    Ok(())
}

// ------------------------------------------------------------------ //
//  Buildings and floors                                               //
// ------------------------------------------------------------------ //

pub async fn list_buildings(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_buildings().await?))
}

pub async fn create_building(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewBuilding>,
) -> ApiResult<impl IntoResponse> {
    check_text("name", &body.name, MAX_BUILDING_NAME)?;
    if let Some(address) = &body.address {
        if address.chars().count() > MAX_BUILDING_ADDRESS {
            return Err(ApiError::BadRequest(format!("address exceeds {MAX_BUILDING_ADDRESS} characters")));
        }
    }
    let building = state.store.create_building(body).await?;
    info!(building_id = building.id, "building created");
    Ok((StatusCode::CREATED, Json(building)))
}

pub async fn list_floors(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_floors().await?))
}

pub async fn create_floor(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewFloor>,
) -> ApiResult<impl IntoResponse> {
    check_text("name", &body.name, MAX_FLOOR_NAME)?;
    if state.store.get_building(body.building_id).await?.is_none() {
        return Err(ApiError::not_found("building", body.building_id));
    }
    let floor = state.store.create_floor(body).await?;
    info!(floor_id = floor.id, building_id = floor.building_id, "floor created");
    Ok((StatusCode::CREATED, Json(floor)))
}

/// DELETE /api/v1/floors/:id
pub async fn delete_floor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> ApiResult<StatusCode> {
    if !state.store.delete_floor(id).await? {
        return Err(ApiError::not_found("floor", id));
    }
    info!(floor_id = id, "floor deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/floors/:id/status
pub async fn floor_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> ApiResult<impl IntoResponse> {
    let floor = state
        .store
        .get_floor(id)
        .await?
        .ok_or_else(|| ApiError::not_found("floor", id))?;
    Ok(Json(state.manager.floor_status(&floor).await?))
}

// ------------------------------------------------------------------ //
//  Thresholds                                                         //
// ------------------------------------------------------------------ //

pub async fn list_thresholds(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_thresholds().await?))
}

pub async fn create_threshold(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewThreshold>,
) -> ApiResult<impl IntoResponse> {
    if !body.lower.is_finite() || !body.upper.is_finite() {
        return Err(ApiError::BadRequest("bounds must be finite numbers".into()));
    }
    if body.lower > body.upper {
        return Err(ApiError::BadRequest("lower must not be greater than upper".into()));
    }
    if state.store.get_floor(body.floor_id).await?.is_none() {
        return Err(ApiError::not_found("floor", body.floor_id));
    }
    let band = state.store.replace_threshold(body).await?;
    info!(
        threshold_id = band.id,
        floor_id = band.floor_id,
        variable = %band.variable,
        lower = band.lower,
        upper = band.upper,
        "threshold activated"
    );
    Ok((StatusCode::CREATED, Json(band)))
}

// ------------------------------------------------------------------ //
//  Metrics                                                            //
// ------------------------------------------------------------------ //

/// Record one reading and run it through the alert engine.
async fn ingest_one(state: &AppState, floor: &Floor, m: Measurement, line: Option<u64>) -> IngestItem {
    match state.store.record_measurement(&m).await {
        Ok(id) => {
            let report = state.manager.process_measurement(floor, &m).await;
            IngestItem {
                line,
                floor_id: Some(floor.id),
                measurement_id: Some(id),
                stored: true,
                error: None,
                report: Some(report),
            }
        }
        Err(e) => {
            error!(error = %e, floor_id = floor.id, "failed to record measurement");
            IngestItem::failed(line, Some(floor.id), format!("{e:#}"))
        }
    }
}

/// POST /api/v1/metrics
///
/// A single object answers 201 or an error status; an array answers 200 with
/// per-item outcomes and never fails as a whole.
pub async fn ingest_metrics(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IngestPayload>,
) -> ApiResult<impl IntoResponse> {
    let items = match payload {
        IngestPayload::Single(item) => {
            let floor = state
                .store
                .get_floor(item.floor_id)
                .await?
                .ok_or_else(|| ApiError::not_found("floor", item.floor_id))?;
            let result = ingest_one(&state, &floor, item.into(), None).await;
            if let Some(e) = result.error.as_deref() {
                return Err(ApiError::Internal(anyhow!("{e}")));
            }
            return Ok((StatusCode::CREATED, Json(IngestResponse::from_items(vec![result]))));
        }
        IngestPayload::Batch(items) => items,
    };

    let mut floors: HashMap<i32, Option<Floor>> = HashMap::new();
    let mut results = Vec::with_capacity(items.len());

    for item in items {
        let floor_id = item.floor_id;
        if !floors.contains_key(&floor_id) {
            match state.store.get_floor(floor_id).await {
                Ok(f) => {
                    floors.insert(floor_id, f);
                }
                Err(e) => {
                    error!(error = %e, floor_id, "floor lookup failed");
                    results.push(IngestItem::failed(None, Some(floor_id), format!("{e:#}")));
                    continue;
                }
            }
        }
        match floors.get(&floor_id).and_then(Option::as_ref) {
            Some(floor) => results.push(ingest_one(&state, floor, item.into(), None).await),
            None => results.push(IngestItem::failed(None, Some(floor_id), format!("floor {floor_id} not found"))),
        }
    }

    let response = IngestResponse::from_items(results);
    info!(
        received = response.received,
        stored = response.stored,
        alerts = response.alerts_created,
        "metrics batch processed"
    );
    Ok((StatusCode::OK, Json(response)))
}

const FLOOR_NAME_ATTEMPTS: u32 = 5;

/// Name tried for a new floor on `attempt` (0-based): `Floor N`, then
/// `Floor N (2)`, `Floor N (3)` and so on.
fn floor_name(number: i32, attempt: u32) -> String {
    match attempt {
        0 => format!("Floor {number}"),
        n => format!("Floor {number} ({})", n + 1),
    }
}

/// Find or create the building and the floor numbered `number` in it.
async fn resolve_floor(store: &dyn Store, building_name: &str, number: i32) -> anyhow::Result<Floor> {
    let building = match store.find_building_by_name(building_name).await? {
        Some(b) => b,
        None => {
            let b = store
                .create_building(NewBuilding { name: building_name.to_string(), address: None })
                .await?;
            info!(building_id = b.id, name = building_name, "building created from upload");
            b
        }
    };

    let mut attempt = 0;
    loop {
        if let Some(floor) = store.find_floor_by_number(building.id, number).await? {
            return Ok(floor);
        }
        let new_floor = NewFloor {
            building_id: building.id,
            name: floor_name(number, attempt),
            number,
        };
        match store.create_floor(new_floor).await {
            Ok(floor) => {
                info!(floor_id = floor.id, building_id = building.id, number, name = %floor.name, "floor created from upload");
                return Ok(floor);
            }
            // name taken by another floor, or the floor was created concurrently
            Err(e) if e.downcast_ref::<Conflict>().is_some() && attempt + 1 < FLOOR_NAME_ATTEMPTS => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// POST /api/v1/metrics/csv
pub async fn ingest_csv(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<IngestResponse>> {
    let parsed = csv_import::parse(&body)?;

    let mut results: Vec<IngestItem> = parsed
        .errors
        .iter()
        .map(|e| {
            warn!(line = e.line(), error = %e, "skipping malformed CSV row");
            IngestItem::failed(Some(e.line()), None, e.to_string())
        })
        .collect();

    let mut floors: HashMap<(String, i32), Floor> = HashMap::new();
    for (line, row) in parsed.rows {
        let key = (row.building.clone(), row.floor);
        let floor = match floors.get(&key) {
            Some(f) => f.clone(),
            None => {
                if let Err(e) = check_text("building", &row.building, MAX_BUILDING_NAME) {
                    results.push(IngestItem::failed(Some(line), None, e.to_string()));
                    continue;
                }
                match resolve_floor(state.store.as_ref(), &row.building, row.floor).await {
                    Ok(f) => {
                        floors.insert(key, f.clone());
                        f
                    }
                    Err(e) => {
                        error!(error = %e, line, "could not resolve floor for CSV row");
                        results.push(IngestItem::failed(Some(line), None, format!("{e:#}")));
                        continue;
                    }
                }
            }
        };

        let m = Measurement {
            floor_id: floor.id,
            time: row.time,
            temp_c: row.temp_c,
            humidity_pct: row.humidity_pct,
            energy_kw: row.energy_kw,
        };
        results.push(ingest_one(&state, &floor, m, Some(line)).await);
    }

    results.sort_by_key(|i| i.line);
    let response = IngestResponse::from_items(results);
    info!(
        received = response.received,
        stored = response.stored,
        alerts = response.alerts_created,
        "CSV upload processed"
    );
    Ok(Json(response))
}

/// GET /api/v1/metrics
pub async fn list_metrics(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MetricsQuery>,
) -> ApiResult<impl IntoResponse> {
    let rows = state
        .store
        .measurements(q.floor_id, q.since, q.until, q.limit())
        .await?;
    Ok(Json(rows))
}

// ------------------------------------------------------------------ //
//  Alerts                                                             //
// ------------------------------------------------------------------ //

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AlertFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_alerts(&filter).await?))
}

pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let alert = state
        .store
        .get_alert(id)
        .await?
        .ok_or_else(|| ApiError::not_found("alert", id))?;
    Ok(Json(alert))
}

/// PATCH /api/v1/alerts/:id/status
pub async fn update_alert_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<StatusUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.update_status(id, body.status).await?))
}

// ------------------------------------------------------------------ //
//  Health                                                             //
// ------------------------------------------------------------------ //

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
