//! In-memory store for tests and local runs without Postgres.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Alert, AlertFilter, AlertStatus, Building, Floor, Measurement, MeasurementRecord, NewAlert,
    NewBuilding, NewFloor, NewThreshold, ThresholdBand, Variable,
};
use crate::store::{AlertStore, Conflict, Directory, MeasurementStore, ThresholdStore};

#[derive(Debug, Default)]
struct Tables {
    buildings: Vec<Building>,
    floors: Vec<Floor>,
    thresholds: Vec<ThresholdBand>,
    measurements: Vec<MeasurementRecord>,
    alerts: Vec<Alert>,
    failing_alert_variables: HashSet<Variable>,
}

/// Store that keeps every table in a `Vec` behind a mutex.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent alert insert for `variable` fail.
    pub fn fail_alert_inserts(&self, variable: Variable) {
        self.tables.lock().unwrap().failing_alert_variables.insert(variable);
    }

    /// Snapshot of all alerts, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.tables.lock().unwrap().alerts.clone()
    }
}

#[async_trait]
impl ThresholdStore for MemoryStore {
    async fn active_band(&self, floor_id: i32, variable: Variable) -> Result<Option<ThresholdBand>> {
        let t = self.tables.lock().unwrap();
        Ok(t.thresholds
            .iter()
            .find(|b| b.floor_id == floor_id && b.variable == variable && b.is_active)
            .cloned())
    }

    async fn list_thresholds(&self) -> Result<Vec<ThresholdBand>> {
        Ok(self.tables.lock().unwrap().thresholds.clone())
    }

    async fn replace_threshold(&self, threshold: NewThreshold) -> Result<ThresholdBand> {
        let mut t = self.tables.lock().unwrap();
        for b in t.thresholds.iter_mut() {
            if b.floor_id == threshold.floor_id && b.variable == threshold.variable {
                b.is_active = false;
            }
        }
        let band = ThresholdBand {
            id: t.thresholds.len() as i32 + 1,
            floor_id: threshold.floor_id,
            variable: threshold.variable,
            lower: threshold.lower,
            upper: threshold.upper,
            is_active: true,
        };
        t.thresholds.push(band.clone());
        Ok(band)
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn record_measurement(&self, measurement: &Measurement) -> Result<i64> {
        let mut t = self.tables.lock().unwrap();
        let id = t.measurements.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        t.measurements.push(MeasurementRecord { id, measurement: measurement.clone() });
        Ok(id)
    }

    async fn measurements(
        &self,
        floor_id: i32,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<MeasurementRecord>> {
        let t = self.tables.lock().unwrap();
        let mut rows: Vec<MeasurementRecord> = t
            .measurements
            .iter()
            .filter(|r| r.measurement.floor_id == floor_id)
            .filter(|r| since.map_or(true, |s| r.measurement.time >= s))
            .filter(|r| until.map_or(true, |u| r.measurement.time <= u))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.measurement.time.cmp(&a.measurement.time));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert> {
        let mut t = self.tables.lock().unwrap();
        if t.failing_alert_variables.contains(&alert.variable) {
            bail!("alert insert rejected for {}", alert.variable);
        }
        let row = Alert {
            id: t.alerts.iter().map(|a| a.id).max().unwrap_or(0) + 1,
            created_at: alert.created_at,
            floor_id: alert.floor_id,
            variable: alert.variable,
            level: alert.level,
            status: AlertStatus::Open,
            message: alert.message,
            recommendation: alert.recommendation,
        };
        t.alerts.push(row.clone());
        Ok(row)
    }

    async fn has_open_alert_since(
        &self,
        floor_id: i32,
        variable: Variable,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let t = self.tables.lock().unwrap();
        Ok(t.alerts.iter().any(|a| {
            a.floor_id == floor_id
                && a.variable == variable
                && a.status == AlertStatus::Open
                && a.created_at >= since
        }))
    }

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>> {
        let t = self.tables.lock().unwrap();
        Ok(t.alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn set_alert_status(&self, id: i64, status: AlertStatus) -> Result<Option<Alert>> {
        let mut t = self.tables.lock().unwrap();
        Ok(t.alerts.iter_mut().find(|a| a.id == id).map(|a| {
            a.status = status;
            a.clone()
        }))
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let t = self.tables.lock().unwrap();
        let mut rows: Vec<Alert> = t
            .alerts
            .iter()
            .filter(|a| filter.floor_id.map_or(true, |f| a.floor_id == f))
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(filter.limit() as usize);
        Ok(rows)
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn list_buildings(&self) -> Result<Vec<Building>> {
        Ok(self.tables.lock().unwrap().buildings.clone())
    }

    async fn get_building(&self, id: i32) -> Result<Option<Building>> {
        let t = self.tables.lock().unwrap();
        Ok(t.buildings.iter().find(|b| b.id == id).cloned())
    }

    async fn create_building(&self, building: NewBuilding) -> Result<Building> {
        let mut t = self.tables.lock().unwrap();
        let row = Building {
            id: t.buildings.len() as i32 + 1,
            name: building.name,
            address: building.address,
        };
        t.buildings.push(row.clone());
        Ok(row)
    }

    async fn find_building_by_name(&self, name: &str) -> Result<Option<Building>> {
        let t = self.tables.lock().unwrap();
        Ok(t.buildings.iter().find(|b| b.name == name).cloned())
    }

    async fn list_floors(&self) -> Result<Vec<Floor>> {
        Ok(self.tables.lock().unwrap().floors.clone())
    }

    async fn get_floor(&self, id: i32) -> Result<Option<Floor>> {
        let t = self.tables.lock().unwrap();
        Ok(t.floors.iter().find(|f| f.id == id).cloned())
    }

    async fn create_floor(&self, floor: NewFloor) -> Result<Floor> {
        let mut t = self.tables.lock().unwrap();
        if !t.buildings.iter().any(|b| b.id == floor.building_id) {
            return Err(anyhow!("building {} does not exist", floor.building_id));
        }
        if t.floors
            .iter()
            .any(|f| f.building_id == floor.building_id && f.name == floor.name)
        {
            return Err(Conflict(format!(
                "floor '{}' already exists in building {}",
                floor.name, floor.building_id
            ))
            .into());
        }
        let next_id = t.floors.iter().map(|f| f.id).max().unwrap_or(0) + 1;
        let row = Floor {
            id: next_id,
            building_id: floor.building_id,
            name: floor.name,
            number: floor.number,
        };
        t.floors.push(row.clone());
        Ok(row)
    }

    async fn find_floor_by_number(&self, building_id: i32, number: i32) -> Result<Option<Floor>> {
        let t = self.tables.lock().unwrap();
        Ok(t.floors
            .iter()
            .find(|f| f.building_id == building_id && f.number == number)
            .cloned())
    }

    async fn delete_floor(&self, id: i32) -> Result<bool> {
        let mut t = self.tables.lock().unwrap();
        let before = t.floors.len();
        t.floors.retain(|f| f.id != id);
        if t.floors.len() == before {
            return Ok(false);
        }
        t.thresholds.retain(|b| b.floor_id != id);
        t.measurements.retain(|m| m.measurement.floor_id != id);
        t.alerts.retain(|a| a.floor_id != id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::Severity;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn new_alert(at: DateTime<Utc>, variable: Variable) -> NewAlert {
        NewAlert {
            created_at: at,
            floor_id: 1,
            variable,
            level: Severity::Critical,
            message: "m".into(),
            recommendation: None,
        }
    }

    #[tokio::test]
    async fn replace_threshold_keeps_history_inactive() {
        let store = MemoryStore::new();
        let nt = |lower, upper| NewThreshold { floor_id: 1, variable: Variable::Energy, lower, upper };
        store.replace_threshold(nt(0.0, 10.0)).await.unwrap();
        let second = store.replace_threshold(nt(0.0, 20.0)).await.unwrap();

        let all = store.list_thresholds().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|b| b.is_active).count(), 1);
        let active = store.active_band(1, Variable::Energy).await.unwrap().unwrap();
        assert_eq!(active, second);
    }

    #[tokio::test]
    async fn open_alert_window_respects_status() {
        let store = MemoryStore::new();
        let a = store.insert_alert(new_alert(t0(), Variable::Temperature)).await.unwrap();
        let since = t0() - Duration::minutes(30);
        assert!(store.has_open_alert_since(1, Variable::Temperature, since).await.unwrap());
        assert!(!store.has_open_alert_since(1, Variable::Humidity, since).await.unwrap());

        store.set_alert_status(a.id, AlertStatus::Closed).await.unwrap();
        assert!(!store.has_open_alert_since(1, Variable::Temperature, since).await.unwrap());
    }

    #[tokio::test]
    async fn delete_floor_cascades() {
        let store = MemoryStore::new();
        let b = store
            .create_building(NewBuilding { name: "HQ".into(), address: None })
            .await
            .unwrap();
        let f = store
            .create_floor(NewFloor { building_id: b.id, name: "Floor 1".into(), number: 1 })
            .await
            .unwrap();
        store.insert_alert(new_alert(t0(), Variable::Energy)).await.unwrap();

        assert!(store.delete_floor(f.id).await.unwrap());
        assert!(store.alerts().is_empty());
        assert!(!store.delete_floor(f.id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_floor_name_rejected() {
        let store = MemoryStore::new();
        let b = store
            .create_building(NewBuilding { name: "HQ".into(), address: None })
            .await
            .unwrap();
        let nf = NewFloor { building_id: b.id, name: "Lobby".into(), number: 0 };
        store.create_floor(nf.clone()).await.unwrap();
        let err = store.create_floor(nf).await.unwrap_err();
        assert!(err.downcast_ref::<Conflict>().is_some());
    }
}
