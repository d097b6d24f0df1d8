//! CSV upload parsing.
//!
//! Expected header: `building,floor,time,temp_c,humidity_pct,energy_kw`.
//! `floor` is the floor number, `time` is RFC 3339 and empty cells are absent
//! values. Column order is free; extra columns are ignored.

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Deserialize;
use thiserror::Error;

use crate::models::finite_reading;

pub const REQUIRED_COLUMNS: [&str; 6] = ["building", "floor", "time", "temp_c", "humidity_pct", "energy_kw"];

/// Failure that rejects the whole upload.
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("CSV is missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error("unreadable CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Failure confined to one line; the line is skipped.
#[derive(Debug, Error)]
pub enum CsvRowError {
    #[error("line {line}: {message}")]
    Malformed { line: u64, message: String },

    #[error("line {line}: building name is empty")]
    EmptyBuilding { line: u64 },
}

impl CsvRowError {
    pub fn line(&self) -> u64 {
        match self {
            CsvRowError::Malformed { line, .. } | CsvRowError::EmptyBuilding { line } => *line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CsvRow {
    pub building: String,
    pub floor: i32,
    pub time: DateTime<Utc>,
    #[serde(deserialize_with = "finite_reading")]
    pub temp_c: Option<f64>,
    #[serde(deserialize_with = "finite_reading")]
    pub humidity_pct: Option<f64>,
    #[serde(deserialize_with = "finite_reading")]
    pub energy_kw: Option<f64>,
}

#[derive(Debug, Default)]
pub struct ParsedCsv {
    /// `(line, row)` in file order.
    pub rows: Vec<(u64, CsvRow)>,
    pub errors: Vec<CsvRowError>,
}

pub fn parse(body: &[u8]) -> Result<ParsedCsv, CsvError> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(body);

    let headers = reader.headers()?.clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(CsvError::MissingColumn(column));
        }
    }

    let mut parsed = ParsedCsv::default();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                parsed.errors.push(CsvRowError::Malformed { line, message: e.to_string() });
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        if is_blank(&record) {
            continue;
        }
        match record.deserialize::<CsvRow>(Some(&headers)) {
            Ok(row) if row.building.is_empty() => parsed.errors.push(CsvRowError::EmptyBuilding { line }),
            Ok(row) => parsed.rows.push((line, row)),
            Err(e) => parsed.errors.push(CsvRowError::Malformed { line, message: e.to_string() }),
        }
    }
    Ok(parsed)
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(str::is_empty)
}
