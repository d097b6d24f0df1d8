//! Severity evaluation for floor readings.
//!
//! Temperature and humidity have fixed comfort rules. Energy (and anything
//! else without a bespoke rule) is judged against the floor's active
//! [`Band`], falling back to the configured default when none is set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{ParseEnumError, ThresholdBand, Variable};

// ------------------------------------------------------------------ //
//  Types                                                              //
// ------------------------------------------------------------------ //

/// Severity of a single evaluation. `None` only arises from missing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Info,
    Medium,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None     => "none",
            Severity::Info     => "info",
            Severity::Medium   => "medium",
            Severity::Critical => "critical",
        }
    }

    /// Whether this severity is high enough to open an alert.
    pub fn is_escalated(self) -> bool {
        self >= Severity::Medium
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none"     => Ok(Severity::None),
            "info"     => Ok(Severity::Info),
            "medium"   => Ok(Severity::Medium),
            "critical" => Ok(Severity::Critical),
            other => Err(ParseEnumError { kind: "severity", value: other.to_string() }),
        }
    }
}

/// An acceptable `[lower, upper]` range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub lower: f64,
    pub upper: f64,
}

impl Band {
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Distance from the nearest bound, or `None` when inside (bounds inclusive).
    pub fn distance_outside(&self, value: f64) -> Option<f64> {
        if value < self.lower {
            Some(self.lower - value)
        } else if value > self.upper {
            Some(value - self.upper)
        } else {
            None
        }
    }
}

impl From<&ThresholdBand> for Band {
    fn from(t: &ThresholdBand) -> Self {
        Band::new(t.lower, t.upper)
    }
}

/// Built-in bands used when a floor has no active threshold configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdDefaults {
    /// Default energy band in kW.
    pub energy: Band,
    /// Minimum band width used as the ratio denominator.
    pub epsilon: f64,
}

impl Default for ThresholdDefaults {
    fn default() -> Self {
        Self {
            energy: Band::new(0.0, 10.0),
            epsilon: 1e-6,
        }
    }
}

/// Outcome of evaluating one variable of one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub variable: Variable,
    pub value: Option<f64>,
    pub severity: Severity,
    pub message: String,
}

// ------------------------------------------------------------------ //
//  Evaluation                                                         //
// ------------------------------------------------------------------ //

const TEMP_ELEVATED: f64 = 26.0;
const TEMP_HIGH: f64 = 28.0;
const TEMP_CRITICAL: f64 = 29.5;

const HUMIDITY_CRIT_LOW: f64 = 20.0;
const HUMIDITY_MEDIUM_LOW: f64 = 22.0;
const HUMIDITY_OPTIMAL_LOW: f64 = 25.0;
const HUMIDITY_OPTIMAL_HIGH: f64 = 70.0;
const HUMIDITY_MEDIUM_HIGH: f64 = 75.0;
const HUMIDITY_CRIT_HIGH: f64 = 80.0;

/// Share of the band width beyond which an out-of-band value is critical.
const CRITICAL_RATIO: f64 = 0.25;

/// Stateless evaluator configured once with its default bands.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    defaults: ThresholdDefaults,
}

impl Evaluator {
    pub fn new(defaults: ThresholdDefaults) -> Self {
        Self { defaults }
    }

    /// Whether `variable` is judged against a configured band.
    pub fn uses_band(variable: Variable) -> bool {
        matches!(variable, Variable::Energy)
    }

    /// Evaluate one variable. `band` is the floor's active band, if any; it is
    /// ignored by the temperature and humidity rules. NaN and infinities count
    /// as no data.
    pub fn evaluate(&self, variable: Variable, value: Option<f64>, band: Option<Band>) -> Evaluation {
        let Some(v) = value.filter(|v| v.is_finite()) else {
            return Evaluation {
                variable,
                value: None,
                severity: Severity::None,
                message: "No data".to_string(),
            };
        };

        let (severity, message) = match variable {
            Variable::Temperature => evaluate_temperature(v),
            Variable::Humidity => evaluate_humidity(v),
            Variable::Energy => {
                let band = band.unwrap_or(self.defaults.energy);
                evaluate_band(variable, v, band, self.defaults.epsilon)
            }
        };

        Evaluation { variable, value: Some(v), severity, message }
    }
}

/// Temperature comfort rule (°C).
pub fn evaluate_temperature(t: f64) -> (Severity, String) {
    if t < TEMP_ELEVATED {
        (Severity::Info, format!("Temperature normal ({t:.1}°C)"))
    } else if t < TEMP_HIGH {
        (Severity::Info, format!("Temperature slightly elevated ({t:.1}°C), check ventilation"))
    } else if t < TEMP_CRITICAL {
        (Severity::Medium, format!("High temperature ({t:.1}°C), activate cooling"))
    } else {
        (Severity::Critical, format!("Critical temperature ({t:.1}°C), immediate action required"))
    }
}

/// Relative humidity comfort rule (%). Escalates symmetrically in both directions.
pub fn evaluate_humidity(h: f64) -> (Severity, String) {
    if h < HUMIDITY_CRIT_LOW {
        (Severity::Critical, format!("Humidity too low ({h:.1}%), humidify immediately"))
    } else if h > HUMIDITY_CRIT_HIGH {
        (Severity::Critical, format!("Humidity too high ({h:.1}%), dehumidify immediately"))
    } else if h <= HUMIDITY_MEDIUM_LOW || h > HUMIDITY_MEDIUM_HIGH {
        (Severity::Medium, format!("Humidity in mid range ({h:.1}%), adjust control"))
    } else if h < HUMIDITY_OPTIMAL_LOW || h > HUMIDITY_OPTIMAL_HIGH {
        (Severity::Info, format!("Humidity out of optimal range ({h:.1}%)"))
    } else {
        (Severity::Info, format!("Humidity normal ({h:.1}%)"))
    }
}

/// Band-relative rule: inside is informational, outside escalates by how far
/// the value sits from the band relative to its width.
pub fn evaluate_band(variable: Variable, value: f64, band: Band, epsilon: f64) -> (Severity, String) {
    let unit = variable.unit();
    match band.distance_outside(value) {
        None => (
            Severity::Info,
            format!(
                "{variable} {value:.2}{unit} within range [{:.2}, {:.2}]{unit}",
                band.lower, band.upper
            ),
        ),
        Some(distance) => {
            let width = (band.upper - band.lower).max(epsilon);
            let ratio = distance / width;
            let severity = if ratio >= CRITICAL_RATIO {
                Severity::Critical
            } else {
                Severity::Medium
            };
            let side = if value < band.lower { "below" } else { "above" };
            (
                severity,
                format!(
                    "{variable} {value:.2}{unit} {side} range [{:.2}, {:.2}]{unit} ({:.0}% of band width)",
                    band.lower,
                    band.upper,
                    ratio * 100.0
                ),
            )
        }
    }
}

// ------------------------------------------------------------------ //
//  Aggregation                                                        //
// ------------------------------------------------------------------ //

/// Worst severity across a set of evaluations; `None` for an empty set.
pub fn worst_severity(severities: impl IntoIterator<Item = Severity>) -> Severity {
    severities.into_iter().max().unwrap_or(Severity::None)
}

/// Coarse floor-level label derived from a severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FloorStatus {
    #[serde(rename = "OK")]
    Ok,
    Medium,
    Critical,
}

impl FloorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FloorStatus::Ok       => "OK",
            FloorStatus::Medium   => "Medium",
            FloorStatus::Critical => "Critical",
        }
    }
}

impl From<Severity> for FloorStatus {
    fn from(s: Severity) -> Self {
        match s {
            Severity::None | Severity::Info => FloorStatus::Ok,
            Severity::Medium => FloorStatus::Medium,
            Severity::Critical => FloorStatus::Critical,
        }
    }
}

impl fmt::Display for FloorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
