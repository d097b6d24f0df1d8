//! Alert de-duplication.
//!
//! A new alert for `(floor, variable)` is suppressed while an `open` alert for
//! the same pair was created within the trailing window. Informational
//! severities never open alerts at all.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::model::Variable;
use crate::store::AlertStore;
use crate::threshold::Severity;

pub const DEFAULT_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deduplicator {
    window: Duration,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_WINDOW_MINUTES))
    }
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Whether a new alert should be opened at `now`.
    ///
    /// Alerts created exactly `window` before `now` still suppress.
    pub async fn should_alert_at(
        &self,
        alerts: &dyn AlertStore,
        floor_id: i32,
        variable: Variable,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !severity.is_escalated() {
            return Ok(false);
        }
        let since = now - self.window;
        let recent = alerts.has_open_alert_since(floor_id, variable, since).await?;
        Ok(!recent)
    }

    /// Convenience wrapper that uses the real current time.
    pub async fn should_alert(
        &self,
        alerts: &dyn AlertStore,
        floor_id: i32,
        variable: Variable,
        severity: Severity,
    ) -> Result<bool> {
        self.should_alert_at(alerts, floor_id, variable, severity, Utc::now()).await
    }
}
