//! Domain records shared by the engine, the stores and the gateway.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::threshold::Severity;

/// Maximum stored length of an alert message or recommendation.
pub const MAX_TEXT_LEN: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// ------------------------------------------------------------------ //
//  Variable                                                           //
// ------------------------------------------------------------------ //

/// A monitored environmental variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variable {
    Temperature,
    Humidity,
    Energy,
}

impl Variable {
    pub const ALL: [Variable; 3] = [Variable::Temperature, Variable::Humidity, Variable::Energy];

    pub fn as_str(self) -> &'static str {
        match self {
            Variable::Temperature => "temperature",
            Variable::Humidity    => "humidity",
            Variable::Energy      => "energy",
        }
    }

    /// Display unit, including the separating space where one is customary.
    pub fn unit(self) -> &'static str {
        match self {
            Variable::Temperature => "°C",
            Variable::Humidity    => "%",
            Variable::Energy      => " kW",
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variable {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(Variable::Temperature),
            "humidity"    => Ok(Variable::Humidity),
            "energy"      => Ok(Variable::Energy),
            other => Err(ParseEnumError { kind: "variable", value: other.to_string() }),
        }
    }
}

// ------------------------------------------------------------------ //
//  Alert status                                                       //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Closed,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Open         => "open",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Closed       => "closed",
        }
    }

    /// Position in the nominal open → acknowledged → closed progression.
    pub fn rank(self) -> u8 {
        match self {
            AlertStatus::Open         => 0,
            AlertStatus::Acknowledged => 1,
            AlertStatus::Closed       => 2,
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open"         => Ok(AlertStatus::Open),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "closed"       => Ok(AlertStatus::Closed),
            other => Err(ParseEnumError { kind: "alert status", value: other.to_string() }),
        }
    }
}

// ------------------------------------------------------------------ //
//  Measurements                                                       //
// ------------------------------------------------------------------ //

/// A single reading for a floor. Any of the values may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub floor_id: i32,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub temp_c: Option<f64>,
    #[serde(default)]
    pub humidity_pct: Option<f64>,
    #[serde(default)]
    pub energy_kw: Option<f64>,
}

impl Measurement {
    pub fn value(&self, variable: Variable) -> Option<f64> {
        match variable {
            Variable::Temperature => self.temp_c,
            Variable::Humidity    => self.humidity_pct,
            Variable::Energy      => self.energy_kw,
        }
    }

    /// Variables that carry a value in this reading, in fixed order.
    pub fn populated(&self) -> impl Iterator<Item = (Variable, f64)> + '_ {
        Variable::ALL
            .into_iter()
            .filter_map(move |v| self.value(v).map(|x| (v, x)))
    }
}

/// A measurement as stored, with its row id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    pub id: i64,
    #[serde(flatten)]
    pub measurement: Measurement,
}

// ------------------------------------------------------------------ //
//  Thresholds                                                         //
// ------------------------------------------------------------------ //

/// A configured acceptable range for one variable on one floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub id: i32,
    pub floor_id: i32,
    pub variable: Variable,
    pub lower: f64,
    pub upper: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewThreshold {
    pub floor_id: i32,
    pub variable: Variable,
    pub lower: f64,
    pub upper: f64,
}

// ------------------------------------------------------------------ //
//  Alerts                                                             //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub floor_id: i32,
    pub variable: Variable,
    pub level: Severity,
    pub status: AlertStatus,
    pub message: String,
    pub recommendation: Option<String>,
}

/// An alert about to be persisted. Always created with status `open`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub created_at: DateTime<Utc>,
    pub floor_id: i32,
    pub variable: Variable,
    pub level: Severity,
    pub message: String,
    pub recommendation: Option<String>,
}

/// Filter for alert listings. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AlertFilter {
    pub floor_id: Option<i32>,
    pub status: Option<AlertStatus>,
    pub limit: Option<i64>,
}

impl AlertFilter {
    pub const DEFAULT_LIMIT: i64 = 200;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).max(0)
    }
}

// ------------------------------------------------------------------ //
//  Buildings and floors                                               //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Building {
    pub id: i32,
    pub name: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBuilding {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Floor {
    pub id: i32,
    pub building_id: i32,
    pub name: String,
    pub number: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFloor {
    pub building_id: i32,
    pub name: String,
    pub number: i32,
}

/// Truncate to [`MAX_TEXT_LEN`] characters on a char boundary.
pub fn clamp_text(s: &str) -> String {
    s.chars().take(MAX_TEXT_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn variable_round_trips_through_str() {
        for v in Variable::ALL {
            assert_eq!(v.as_str().parse::<Variable>().unwrap(), v);
        }
        assert!("pressure".parse::<Variable>().is_err());
    }

    #[test]
    fn status_parse_rejects_unknown() {
        let err = "reopened".parse::<AlertStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown alert status 'reopened'");
    }

    #[test]
    fn populated_skips_missing_values() {
        let m = Measurement {
            floor_id: 1,
            time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            temp_c: Some(22.0),
            humidity_pct: None,
            energy_kw: Some(4.2),
        };
        let vars: Vec<Variable> = m.populated().map(|(v, _)| v).collect();
        assert_eq!(vars, vec![Variable::Temperature, Variable::Energy]);
    }

    #[test]
    fn clamp_text_counts_chars_not_bytes() {
        let long = "°".repeat(400);
        let clamped = clamp_text(&long);
        assert_eq!(clamped.chars().count(), MAX_TEXT_LEN);
    }

    #[test]
    fn alert_filter_default_limit() {
        assert_eq!(AlertFilter::default().limit(), 200);
        let f = AlertFilter { limit: Some(-5), ..Default::default() };
        assert_eq!(f.limit(), 0);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&AlertStatus::Acknowledged).unwrap();
        assert_eq!(json, "\"acknowledged\"");
    }
}
