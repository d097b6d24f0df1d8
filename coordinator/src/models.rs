//! Request/response bodies for the coordinator's REST API.

use alert_engine::lifecycle::MeasurementReport;
use alert_engine::model::Measurement;
use alert_engine::AlertStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_METRICS_LIMIT: i64 = 500;

// ------------------------------------------------------------------ //
//  Inbound (client → coordinator)                                     //
// ------------------------------------------------------------------ //

/// One sensor reading as posted by clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricIn {
    pub floor_id: i32,
    pub time: DateTime<Utc>,
    #[serde(default, deserialize_with = "finite_reading")]
    pub temp_c: Option<f64>,
    #[serde(default, deserialize_with = "finite_reading")]
    pub humidity_pct: Option<f64>,
    #[serde(default, deserialize_with = "finite_reading")]
    pub energy_kw: Option<f64>,
}

/// Optional reading that must be a finite number when present.
pub fn finite_reading<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<f64>::deserialize(deserializer)? {
        Some(v) if !v.is_finite() => Err(serde::de::Error::custom(format!("reading {v} is not a finite number"))),
        other => Ok(other),
    }
}

impl From<MetricIn> for Measurement {
    fn from(m: MetricIn) -> Self {
        Measurement {
            floor_id: m.floor_id,
            time: m.time,
            temp_c: m.temp_c,
            humidity_pct: m.humidity_pct,
            energy_kw: m.energy_kw,
        }
    }
}

/// Body of `POST /api/v1/metrics`: one object or an array of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IngestPayload {
    Batch(Vec<MetricIn>),
    Single(MetricIn),
}

/// Query string of `GET /api/v1/metrics`.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsQuery {
    pub floor_id: i32,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl MetricsQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_METRICS_LIMIT).max(0)
    }
}

/// Body of `PATCH /api/v1/alerts/:id/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdate {
    pub status: AlertStatus,
}

// ------------------------------------------------------------------ //
//  Outbound (coordinator → client)                                    //
// ------------------------------------------------------------------ //

/// Outcome of ingesting one reading.
#[derive(Debug, Serialize)]
pub struct IngestItem {
    /// CSV line number, for file uploads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub floor_id: Option<i32>,
    pub measurement_id: Option<i64>,
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<MeasurementReport>,
}

impl IngestItem {
    pub fn failed(line: Option<u64>, floor_id: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            line,
            floor_id,
            measurement_id: None,
            stored: false,
            error: Some(error.into()),
            report: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub received: usize,
    pub stored: usize,
    pub alerts_created: usize,
    pub items: Vec<IngestItem>,
}

impl IngestResponse {
    pub fn from_items(items: Vec<IngestItem>) -> Self {
        let stored = items.iter().filter(|i| i.stored).count();
        let alerts_created = items
            .iter()
            .filter_map(|i| i.report.as_ref())
            .map(|r| r.created_alerts().count())
            .sum();
        Self { received: items.len(), stored, alerts_created, items }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_resolves_to_single() {
        let p: IngestPayload = serde_json::from_str(
            r#"{"floor_id": 3, "time": "2024-07-15T14:00:00Z", "temp_c": 30.0}"#,
        )
        .unwrap();
        assert!(matches!(p, IngestPayload::Single(ref m) if m.floor_id == 3 && m.humidity_pct.is_none()));
    }

    #[test]
    fn array_resolves_to_batch() {
        let p: IngestPayload = serde_json::from_str(
            r#"[
                {"floor_id": 1, "time": "2024-07-15T14:00:00Z", "humidity_pct": 85.0},
                {"floor_id": 2, "time": "2024-07-15T14:05:00+02:00", "energy_kw": 4.2}
            ]"#,
        )
        .unwrap();
        let IngestPayload::Batch(items) = p else { panic!("expected batch") };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].time.to_rfc3339(), "2024-07-15T12:05:00+00:00");
    }

    #[test]
    fn missing_time_is_rejected() {
        assert!(serde_json::from_str::<IngestPayload>(r#"{"floor_id": 1, "temp_c": 20.0}"#).is_err());
    }

    #[test]
    fn non_finite_reading_is_rejected() {
        let err = serde_json::from_str::<MetricIn>(
            r#"{"floor_id": 1, "time": "2024-07-15T14:00:00Z", "temp_c": 1e400}"#,
        );
        assert!(err.is_err());

        let ok: MetricIn = serde_json::from_value(serde_json::json!({
            "floor_id": 1, "time": "2024-07-15T14:00:00Z", "temp_c": null, "energy_kw": 3.5
        }))
        .unwrap();
        assert_eq!(ok.temp_c, None);
        assert_eq!(ok.energy_kw, Some(3.5));
    }

    #[test]
    fn metrics_limit_defaults() {
        let q = MetricsQuery { floor_id: 1, since: None, until: None, limit: None };
        assert_eq!(q.limit(), 500);
    }
}
