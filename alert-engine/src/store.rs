//! Storage traits consumed by the engine and the gateway.
//!
//! The engine only assumes an ordered, indexed, append-only store with simple
//! equality/range filters. [`crate::pg::PgStore`] backs these with Postgres;
//! [`crate::memory::MemoryStore`] keeps everything in process for tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    Alert, AlertFilter, AlertStatus, Building, Floor, Measurement, MeasurementRecord, NewAlert,
    NewBuilding, NewFloor, NewThreshold, ThresholdBand, Variable,
};

/// Uniqueness violation, carried inside an [`anyhow::Error`] so callers can
/// `downcast_ref` it.
#[derive(Debug, Error)]
#[error("conflict: {0}")]
pub struct Conflict(pub String);

/// Active threshold configuration, read-mostly.
#[async_trait]
pub trait ThresholdStore: Send + Sync {
    /// The active band for `(floor_id, variable)`, if one is configured.
    async fn active_band(&self, floor_id: i32, variable: Variable) -> Result<Option<ThresholdBand>>;

    async fn list_thresholds(&self) -> Result<Vec<ThresholdBand>>;

    /// Insert a new active band, deactivating any previous active band for the
    /// same `(floor_id, variable)`.
    async fn replace_threshold(&self, threshold: NewThreshold) -> Result<ThresholdBand>;
}

/// Append-only measurement history.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    async fn record_measurement(&self, measurement: &Measurement) -> Result<i64>;

    /// Measurements for a floor with `since <= time <= until`, newest first.
    async fn measurements(
        &self,
        floor_id: i32,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<MeasurementRecord>>;
}

/// Alert persistence.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert>;

    /// Whether an `open` alert for `(floor_id, variable)` was created at or
    /// after `since`.
    async fn has_open_alert_since(
        &self,
        floor_id: i32,
        variable: Variable,
        since: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>>;

    /// Overwrite the status. Returns `None` when the alert does not exist.
    async fn set_alert_status(&self, id: i64, status: AlertStatus) -> Result<Option<Alert>>;

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>>;
}

/// Buildings and floors, used by the ingestion gateway.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn list_buildings(&self) -> Result<Vec<Building>>;
    async fn get_building(&self, id: i32) -> Result<Option<Building>>;
    async fn create_building(&self, building: NewBuilding) -> Result<Building>;
    async fn find_building_by_name(&self, name: &str) -> Result<Option<Building>>;

    async fn list_floors(&self) -> Result<Vec<Floor>>;
    async fn get_floor(&self, id: i32) -> Result<Option<Floor>>;
    /// Fails when a floor with the same name already exists in the building.
    async fn create_floor(&self, floor: NewFloor) -> Result<Floor>;
    async fn find_floor_by_number(&self, building_id: i32, number: i32) -> Result<Option<Floor>>;
    /// Delete a floor and everything hanging off it. Returns `false` if absent.
    async fn delete_floor(&self, id: i32) -> Result<bool>;
}

/// Everything the gateway needs from one backing store.
pub trait Store: Directory + ThresholdStore + MeasurementStore + AlertStore {}

impl<T> Store for T where T: Directory + ThresholdStore + MeasurementStore + AlertStore {}
