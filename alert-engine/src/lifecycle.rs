//! Alert lifecycle: evaluate each reading, open de-duplicated alerts, and
//! move alerts between statuses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dedup::{Deduplicator, DEFAULT_WINDOW_MINUTES};
use crate::model::{clamp_text, Alert, AlertStatus, Floor, Measurement, NewAlert, Variable};
use crate::recommend::{RecommendationComposer, RecommendationContext, TrendHint};
use crate::store::{AlertStore, MeasurementStore, ThresholdStore};
use crate::threshold::{worst_severity, Band, Evaluation, Evaluator, FloorStatus, Severity, ThresholdDefaults};

pub const DEFAULT_TREND_LOOKBACK_MINUTES: i64 = 120;

/// Upper bound on rows read for trend and floor-status lookups.
const HISTORY_LIMIT: i64 = 500;

// ------------------------------------------------------------------ //
//  Configuration                                                      //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub thresholds: ThresholdDefaults,
    pub dedup_window: Duration,
    pub trend_lookback: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdDefaults::default(),
            dedup_window: Duration::minutes(DEFAULT_WINDOW_MINUTES),
            trend_lookback: Duration::minutes(DEFAULT_TREND_LOOKBACK_MINUTES),
        }
    }
}

// ------------------------------------------------------------------ //
//  Reports                                                            //
// ------------------------------------------------------------------ //

/// What happened to one variable of one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertAction {
    /// Severity below medium; nothing persisted.
    NotEscalated,
    /// An open alert already exists inside the dedup window.
    Suppressed,
    Created { alert: Alert },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableOutcome {
    pub evaluation: Evaluation,
    pub action: AlertAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementReport {
    pub floor_id: i32,
    pub time: DateTime<Utc>,
    pub outcomes: Vec<VariableOutcome>,
    pub worst: Severity,
    pub status: FloorStatus,
}

impl MeasurementReport {
    pub fn created_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.outcomes.iter().filter_map(|o| match &o.action {
            AlertAction::Created { alert } => Some(alert),
            _ => None,
        })
    }
}

/// Current per-variable picture of a floor, from its latest readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FloorStatusReport {
    pub floor_id: i32,
    pub floor_number: i32,
    pub as_of: Option<DateTime<Utc>>,
    pub evaluations: Vec<Evaluation>,
    pub worst: Severity,
    pub status: FloorStatus,
}

#[derive(Debug, Error)]
pub enum StatusUpdateError {
    #[error("alert {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

// ------------------------------------------------------------------ //
//  Per-key serialisation                                              //
// ------------------------------------------------------------------ //

/// One async mutex per `(floor, variable)`, so the dedup check and the insert
/// are not interleaved within this process. Entries live only while some
/// caller holds or waits on them.
#[derive(Debug, Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<(i32, Variable), Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn get(&self, floor_id: i32, variable: Variable) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry((floor_id, variable)).or_default().clone()
    }

    /// Hand back a lock from [`get`](Self::get); the entry is dropped once no
    /// other caller shares it.
    fn release(&self, floor_id: i32, variable: Variable, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        let key = (floor_id, variable);
        if map.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(&key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

// ------------------------------------------------------------------ //
//  Manager                                                            //
// ------------------------------------------------------------------ //

pub struct AlertManager {
    evaluator: Evaluator,
    dedup: Deduplicator,
    composer: RecommendationComposer,
    trend_lookback: Duration,
    alerts: Arc<dyn AlertStore>,
    measurements: Arc<dyn MeasurementStore>,
    thresholds: Arc<dyn ThresholdStore>,
    locks: KeyedLocks,
}

impl AlertManager {
    pub fn new(
        config: EngineConfig,
        composer: RecommendationComposer,
        alerts: Arc<dyn AlertStore>,
        measurements: Arc<dyn MeasurementStore>,
        thresholds: Arc<dyn ThresholdStore>,
    ) -> Self {
        Self {
            evaluator: Evaluator::new(config.thresholds),
            dedup: Deduplicator::new(config.dedup_window),
            composer,
            trend_lookback: config.trend_lookback,
            alerts,
            measurements,
            thresholds,
            locks: KeyedLocks::default(),
        }
    }

    pub fn composer(&self) -> &RecommendationComposer {
        &self.composer
    }

    /// Evaluate a recorded measurement using the wall clock.
    pub async fn process_measurement(&self, floor: &Floor, m: &Measurement) -> MeasurementReport {
        self.process_measurement_at(floor, m, Utc::now()).await
    }

    /// Evaluate every populated variable of `m` and open alerts where due.
    ///
    /// A failure on one variable is logged and reported; the others still run.
    pub async fn process_measurement_at(
        &self,
        floor: &Floor,
        m: &Measurement,
        now: DateTime<Utc>,
    ) -> MeasurementReport {
        let mut outcomes = Vec::with_capacity(Variable::ALL.len());

        for (variable, value) in m.populated() {
            let band = self.band_for(floor.id, variable).await;
            let evaluation = self.evaluator.evaluate(variable, Some(value), band);

            let action = match self.escalate(floor, &evaluation, value, now).await {
                Ok(action) => action,
                Err(e) => {
                    error!(
                        error = %e,
                        floor_id = floor.id,
                        variable = %variable,
                        "alert evaluation failed"
                    );
                    AlertAction::Failed { error: format!("{e:#}") }
                }
            };
            outcomes.push(VariableOutcome { evaluation, action });
        }

        let worst = worst_severity(outcomes.iter().map(|o| o.evaluation.severity));
        MeasurementReport {
            floor_id: floor.id,
            time: m.time,
            outcomes,
            worst,
            status: worst.into(),
        }
    }

    /// Active band for variables judged against one; errors fall back to the
    /// configured default.
    async fn band_for(&self, floor_id: i32, variable: Variable) -> Option<Band> {
        if !Evaluator::uses_band(variable) {
            return None;
        }
        match self.thresholds.active_band(floor_id, variable).await {
            Ok(band) => band.as_ref().map(Band::from),
            Err(e) => {
                warn!(error = %e, floor_id, variable = %variable, "threshold lookup failed, using default band");
                None
            }
        }
    }

    async fn escalate(
        &self,
        floor: &Floor,
        evaluation: &Evaluation,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<AlertAction> {
        let variable = evaluation.variable;
        if !evaluation.severity.is_escalated() {
            return Ok(AlertAction::NotEscalated);
        }

        let lock = self.locks.get(floor.id, variable);
        let result = {
            let _guard = lock.lock().await;
            self.escalate_locked(floor, evaluation, value, now).await
        };
        self.locks.release(floor.id, variable, lock);
        result
    }

    /// Dedup check, composition and insert; runs under the key's lock.
    async fn escalate_locked(
        &self,
        floor: &Floor,
        evaluation: &Evaluation,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<AlertAction> {
        let variable = evaluation.variable;
        let permitted = self
            .dedup
            .should_alert_at(self.alerts.as_ref(), floor.id, variable, evaluation.severity, now)
            .await?;
        if !permitted {
            debug!(floor_id = floor.id, variable = %variable, "alert suppressed by open alert in window");
            return Ok(AlertAction::Suppressed);
        }

        let trend = match self.trend_hint(floor.id, variable, now).await {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(error = %e, floor_id = floor.id, "trend lookup failed");
                None
            }
        };

        let recommendation = self
            .composer
            .compose(&RecommendationContext {
                variable,
                severity: evaluation.severity,
                floor_number: floor.number,
                value,
                trend,
            })
            .await;

        let alert = self
            .alerts
            .insert_alert(NewAlert {
                created_at: now,
                floor_id: floor.id,
                variable,
                level: evaluation.severity,
                message: clamp_text(&evaluation.message),
                recommendation: Some(recommendation.into_text()),
            })
            .await?;

        info!(
            alert_id = alert.id,
            floor_id = floor.id,
            variable = %variable,
            level = %alert.level,
            "alert opened"
        );
        Ok(AlertAction::Created { alert })
    }

    async fn trend_hint(&self, floor_id: i32, variable: Variable, now: DateTime<Utc>) -> Result<TrendHint> {
        let since = now - self.trend_lookback;
        let rows = self
            .measurements
            .measurements(floor_id, Some(since), Some(now), HISTORY_LIMIT)
            .await?;
        // rows are newest first
        let values: Vec<f64> = rows
            .iter()
            .rev()
            .filter_map(|r| r.measurement.value(variable))
            .collect();
        Ok(TrendHint::from_chronological(&values))
    }

    /// Overwrite an alert's status. Any status may follow any other; backward
    /// moves are logged.
    pub async fn update_status(&self, id: i64, status: AlertStatus) -> Result<Alert, StatusUpdateError> {
        let current = self
            .alerts
            .get_alert(id)
            .await?
            .ok_or(StatusUpdateError::NotFound(id))?;

        if status.rank() < current.status.rank() {
            warn!(alert_id = id, from = %current.status, to = %status, "backward alert status transition");
        }

        let updated = self
            .alerts
            .set_alert_status(id, status)
            .await?
            .ok_or(StatusUpdateError::NotFound(id))?;

        info!(alert_id = id, status = %updated.status, "alert status updated");
        Ok(updated)
    }

    /// Evaluate the most recent value of every variable for `floor`.
    pub async fn floor_status(&self, floor: &Floor) -> Result<FloorStatusReport> {
        let rows = self
            .measurements
            .measurements(floor.id, None, None, HISTORY_LIMIT)
            .await?;

        let mut evaluations = Vec::with_capacity(Variable::ALL.len());
        for variable in Variable::ALL {
            let latest = rows.iter().find_map(|r| r.measurement.value(variable));
            let band = self.band_for(floor.id, variable).await;
            evaluations.push(self.evaluator.evaluate(variable, latest, band));
        }

        let worst = worst_severity(evaluations.iter().map(|e| e.severity));
        Ok(FloorStatusReport {
            floor_id: floor.id,
            floor_number: floor.number,
            as_of: rows.first().map(|r| r.measurement.time),
            evaluations,
            worst,
            status: worst.into(),
        })
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{ScriptStep, ScriptedGenerator};
    use crate::memory::MemoryStore;
    use crate::model::NewThreshold;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn floor() -> Floor {
        Floor { id: 11, building_id: 1, name: "Floor 2".into(), number: 2 }
    }

    fn manager(store: &MemoryStore, composer: RecommendationComposer) -> AlertManager {
        let s = Arc::new(store.clone());
        AlertManager::new(EngineConfig::default(), composer, s.clone(), s.clone(), s)
    }

    fn reading(at: DateTime<Utc>) -> Measurement {
        Measurement { floor_id: 11, time: at, temp_c: None, humidity_pct: None, energy_kw: None }
    }

    #[tokio::test]
    async fn info_reading_creates_nothing() {
        let store = MemoryStore::new();
        let m = manager(&store, RecommendationComposer::fallback_only());
        let r = m
            .process_measurement_at(&floor(), &Measurement { temp_c: Some(22.0), ..reading(t0()) }, t0())
            .await;
        assert_eq!(r.outcomes.len(), 1);
        assert_eq!(r.outcomes[0].action, AlertAction::NotEscalated);
        assert_eq!(r.status, FloorStatus::Ok);
        assert!(store.alerts().is_empty());
    }

    #[tokio::test]
    async fn one_failing_variable_does_not_block_others() {
        let store = MemoryStore::new();
        store.fail_alert_inserts(Variable::Temperature);
        let m = manager(&store, RecommendationComposer::fallback_only());
        let reading = Measurement {
            temp_c: Some(31.0),
            humidity_pct: Some(85.0),
            ..reading(t0())
        };
        let r = m.process_measurement_at(&floor(), &reading, t0()).await;

        assert!(matches!(r.outcomes[0].action, AlertAction::Failed { .. }));
        assert!(matches!(r.outcomes[1].action, AlertAction::Created { .. }));
        assert_eq!(store.alerts().len(), 1);
        assert_eq!(store.alerts()[0].variable, Variable::Humidity);
        assert_eq!(r.worst, Severity::Critical);
    }

    #[tokio::test]
    async fn energy_uses_configured_band() {
        let store = MemoryStore::new();
        store
            .replace_threshold(NewThreshold { floor_id: 11, variable: Variable::Energy, lower: 0.0, upper: 40.0 })
            .await
            .unwrap();
        let m = manager(&store, RecommendationComposer::fallback_only());
        let r = m
            .process_measurement_at(&floor(), &Measurement { energy_kw: Some(25.0), ..reading(t0()) }, t0())
            .await;
        assert_eq!(r.outcomes[0].evaluation.severity, Severity::Info);

        let r = m
            .process_measurement_at(&floor(), &Measurement { energy_kw: Some(45.0), ..reading(t0()) }, t0())
            .await;
        assert_eq!(r.outcomes[0].evaluation.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn increasing_trend_reaches_prompt() {
        let store = MemoryStore::new();
        for (mins, t) in [(90, 26.0), (60, 27.5), (30, 28.8)] {
            store
                .record_measurement(&Measurement { temp_c: Some(t), ..reading(t0() - Duration::minutes(mins)) })
                .await
                .unwrap();
        }
        let current = Measurement { temp_c: Some(30.2), ..reading(t0()) };
        store.record_measurement(&current).await.unwrap();

        let g = Arc::new(ScriptedGenerator::new([ScriptStep::stop(
            "Set Floor 2 setpoint to 23°C within the next 15 min.",
        )]));
        let composer = RecommendationComposer::with_generator(g.clone(), std::time::Duration::from_secs(1));
        let m = manager(&store, composer);

        let r = m.process_measurement_at(&floor(), &current, t0()).await;
        let alert = r.created_alerts().next().unwrap();
        assert_eq!(
            alert.recommendation.as_deref(),
            Some("Set Floor 2 setpoint to 23°C within the next 15 min.")
        );
        let prompt = &g.prompts()[0];
        assert!(prompt.contains("increasing across 4 recent readings"));
    }

    #[tokio::test]
    async fn trend_ignores_readings_before_lookback() {
        let store = MemoryStore::new();
        // 35.0 at -150 min would turn the trend downward if it were counted
        for (mins, t) in [(150, 35.0), (60, 27.5), (30, 28.8)] {
            store
                .record_measurement(&Measurement { temp_c: Some(t), ..reading(t0() - Duration::minutes(mins)) })
                .await
                .unwrap();
        }
        let current = Measurement { temp_c: Some(30.2), ..reading(t0()) };
        store.record_measurement(&current).await.unwrap();

        let g = Arc::new(ScriptedGenerator::new([ScriptStep::stop(
            "Set Floor 2 setpoint to 23°C within the next 15 min.",
        )]));
        let composer = RecommendationComposer::with_generator(g.clone(), std::time::Duration::from_secs(1));
        let m = manager(&store, composer);

        m.process_measurement_at(&floor(), &current, t0()).await;
        let prompt = &g.prompts()[0];
        assert!(prompt.contains("increasing across 3 recent readings"), "{prompt}");
    }

    #[tokio::test]
    async fn lock_entries_are_dropped_after_use() {
        let store = MemoryStore::new();
        let m = manager(&store, RecommendationComposer::fallback_only());
        let reading = Measurement { temp_c: Some(32.0), humidity_pct: Some(90.0), ..reading(t0()) };
        m.process_measurement_at(&floor(), &reading, t0()).await;
        m.process_measurement_at(&floor(), &reading, t0()).await;
        assert_eq!(store.alerts().len(), 2);
        assert_eq!(m.locks.len(), 0);
    }

    #[tokio::test]
    async fn update_status_is_permissive() {
        let store = MemoryStore::new();
        let m = manager(&store, RecommendationComposer::fallback_only());
        let r = m
            .process_measurement_at(&floor(), &Measurement { energy_kw: Some(30.0), ..reading(t0()) }, t0())
            .await;
        let id = r.created_alerts().next().unwrap().id;

        let closed = m.update_status(id, AlertStatus::Closed).await.unwrap();
        assert_eq!(closed.status, AlertStatus::Closed);
        let reopened = m.update_status(id, AlertStatus::Open).await.unwrap();
        assert_eq!(reopened.status, AlertStatus::Open);
    }

    #[tokio::test]
    async fn update_status_unknown_alert() {
        let store = MemoryStore::new();
        let m = manager(&store, RecommendationComposer::fallback_only());
        let err = m.update_status(99, AlertStatus::Acknowledged).await.unwrap_err();
        assert!(matches!(err, StatusUpdateError::NotFound(99)));
    }

    #[tokio::test]
    async fn floor_status_uses_latest_value_per_variable() {
        let store = MemoryStore::new();
        store
            .record_measurement(&Measurement { humidity_pct: Some(78.0), ..reading(t0() - Duration::minutes(10)) })
            .await
            .unwrap();
        store
            .record_measurement(&Measurement { temp_c: Some(23.0), ..reading(t0()) })
            .await
            .unwrap();
        let m = manager(&store, RecommendationComposer::fallback_only());

        let report = m.floor_status(&floor()).await.unwrap();
        assert_eq!(report.as_of, Some(t0()));
        assert_eq!(report.evaluations[0].severity, Severity::Info);
        assert_eq!(report.evaluations[1].severity, Severity::Medium);
        assert_eq!(report.evaluations[2].severity, Severity::None);
        assert_eq!(report.status, FloorStatus::Medium);
    }

    #[tokio::test]
    async fn concurrent_same_key_opens_one_alert() {
        let store = MemoryStore::new();
        let m = Arc::new(manager(&store, RecommendationComposer::fallback_only()));
        let reading = Measurement { temp_c: Some(32.0), ..reading(t0()) };

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                let reading = reading.clone();
                tokio::spawn(async move { m.process_measurement_at(&floor(), &reading, t0()).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.alerts().len(), 1);
        assert_eq!(m.locks.len(), 0);
    }
}
