//! PostgreSQL store.
//!
//! Uses raw [`sqlx`] queries against a small schema created idempotently by
//! [`PgStore::migrate`]. Enumerations are stored as lowercase `TEXT`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use crate::model::{
    Alert, AlertFilter, AlertStatus, Building, Floor, Measurement, MeasurementRecord, NewAlert,
    NewBuilding, NewFloor, NewThreshold, ThresholdBand, Variable,
};
use crate::store::{AlertStore, Conflict, Directory, MeasurementStore, ThresholdStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS buildings (
        id         SERIAL PRIMARY KEY,
        name       VARCHAR(150) NOT NULL,
        address    VARCHAR(200),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS floors (
        id          SERIAL PRIMARY KEY,
        building_id INTEGER NOT NULL REFERENCES buildings(id) ON DELETE CASCADE,
        name        VARCHAR(100) NOT NULL,
        number      INTEGER NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS ix_floors_building_name_unique ON floors (building_id, name)",
    r#"
    CREATE TABLE IF NOT EXISTS thresholds (
        id         SERIAL PRIMARY KEY,
        floor_id   INTEGER NOT NULL REFERENCES floors(id) ON DELETE CASCADE,
        variable   TEXT NOT NULL,
        lower      DOUBLE PRECISION NOT NULL,
        upper      DOUBLE PRECISION NOT NULL,
        is_active  BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_active_threshold_per_var_floor
        ON thresholds (floor_id, variable) WHERE is_active
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS measurements (
        id           BIGSERIAL PRIMARY KEY,
        time         TIMESTAMPTZ NOT NULL,
        floor_id     INTEGER NOT NULL REFERENCES floors(id) ON DELETE CASCADE,
        temp_c       DOUBLE PRECISION,
        humidity_pct DOUBLE PRECISION,
        energy_kw    DOUBLE PRECISION
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_measurements_floor_time ON measurements (floor_id, time)",
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id             BIGSERIAL PRIMARY KEY,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        floor_id       INTEGER NOT NULL REFERENCES floors(id) ON DELETE CASCADE,
        variable       TEXT NOT NULL,
        level          TEXT NOT NULL,
        status         TEXT NOT NULL DEFAULT 'open',
        message        VARCHAR(300) NOT NULL,
        recommendation VARCHAR(300)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_alerts_floor_created ON alerts (floor_id, created_at)",
];

const ALERT_COLUMNS: &str =
    "id, created_at, floor_id, variable, level, status, message, recommendation";

/// Postgres-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to PostgreSQL using the supplied `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    /// Create tables and indexes that do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema")?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  Row mapping                                                        //
// ------------------------------------------------------------------ //

fn alert_from_row(r: &PgRow) -> Result<Alert> {
    Ok(Alert {
        id: r.try_get("id")?,
        created_at: r.try_get("created_at")?,
        floor_id: r.try_get("floor_id")?,
        variable: r.try_get::<String, _>("variable")?.parse()?,
        level: r.try_get::<String, _>("level")?.parse()?,
        status: r.try_get::<String, _>("status")?.parse()?,
        message: r.try_get("message")?,
        recommendation: r.try_get("recommendation")?,
    })
}

fn band_from_row(r: &PgRow) -> Result<ThresholdBand> {
    Ok(ThresholdBand {
        id: r.try_get("id")?,
        floor_id: r.try_get("floor_id")?,
        variable: r.try_get::<String, _>("variable")?.parse()?,
        lower: r.try_get("lower")?,
        upper: r.try_get("upper")?,
        is_active: r.try_get("is_active")?,
    })
}

fn measurement_from_row(r: &PgRow) -> Result<MeasurementRecord> {
    Ok(MeasurementRecord {
        id: r.try_get("id")?,
        measurement: Measurement {
            floor_id: r.try_get("floor_id")?,
            time: r.try_get("time")?,
            temp_c: r.try_get("temp_c")?,
            humidity_pct: r.try_get("humidity_pct")?,
            energy_kw: r.try_get("energy_kw")?,
        },
    })
}

fn floor_from_row(r: &PgRow) -> Result<Floor> {
    Ok(Floor {
        id: r.try_get("id")?,
        building_id: r.try_get("building_id")?,
        name: r.try_get("name")?,
        number: r.try_get("number")?,
    })
}

fn building_from_row(r: &PgRow) -> Result<Building> {
    Ok(Building {
        id: r.try_get("id")?,
        name: r.try_get("name")?,
        address: r.try_get("address")?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ------------------------------------------------------------------ //
//  Thresholds                                                         //
// ------------------------------------------------------------------ //

#[async_trait]
impl ThresholdStore for PgStore {
    async fn active_band(&self, floor_id: i32, variable: Variable) -> Result<Option<ThresholdBand>> {
        let row = sqlx::query(
            r#"
            SELECT id, floor_id, variable, lower, upper, is_active
            FROM thresholds
            WHERE floor_id = $1 AND variable = $2 AND is_active
            "#,
        )
        .bind(floor_id)
        .bind(variable.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("active threshold lookup failed")?;

        row.as_ref().map(band_from_row).transpose()
    }

    async fn list_thresholds(&self) -> Result<Vec<ThresholdBand>> {
        let rows = sqlx::query(
            "SELECT id, floor_id, variable, lower, upper, is_active FROM thresholds ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("threshold list failed")?;

        rows.iter().map(band_from_row).collect()
    }

    async fn replace_threshold(&self, threshold: NewThreshold) -> Result<ThresholdBand> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE thresholds SET is_active = FALSE WHERE floor_id = $1 AND variable = $2 AND is_active",
        )
        .bind(threshold.floor_id)
        .bind(threshold.variable.as_str())
        .execute(&mut *tx)
        .await
        .context("threshold deactivation failed")?;

        let row = sqlx::query(
            r#"
            INSERT INTO thresholds (floor_id, variable, lower, upper, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            RETURNING id, floor_id, variable, lower, upper, is_active
            "#,
        )
        .bind(threshold.floor_id)
        .bind(threshold.variable.as_str())
        .bind(threshold.lower)
        .bind(threshold.upper)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                anyhow::Error::new(Conflict(format!(
                    "an active {} threshold already exists for floor {}",
                    threshold.variable, threshold.floor_id
                )))
            } else {
                anyhow::Error::new(e).context("threshold insert failed")
            }
        })?;

        tx.commit().await?;
        band_from_row(&row)
    }
}

// ------------------------------------------------------------------ //
//  Measurements                                                       //
// ------------------------------------------------------------------ //

#[async_trait]
impl MeasurementStore for PgStore {
    async fn record_measurement(&self, m: &Measurement) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO measurements (time, floor_id, temp_c, humidity_pct, energy_kw)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(m.time)
        .bind(m.floor_id)
        .bind(m.temp_c)
        .bind(m.humidity_pct)
        .bind(m.energy_kw)
        .fetch_one(&self.pool)
        .await
        .context("measurement INSERT failed")?;

        Ok(id)
    }

    async fn measurements(
        &self,
        floor_id: i32,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<MeasurementRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, time, floor_id, temp_c, humidity_pct, energy_kw
            FROM measurements
            WHERE floor_id = $1
              AND ($2::timestamptz IS NULL OR time >= $2)
              AND ($3::timestamptz IS NULL OR time <= $3)
            ORDER BY time DESC
            LIMIT $4
            "#,
        )
        .bind(floor_id)
        .bind(since)
        .bind(until)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .context("measurement query failed")?;

        rows.iter().map(measurement_from_row).collect()
    }
}

// ------------------------------------------------------------------ //
//  Alerts                                                             //
// ------------------------------------------------------------------ //

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert> {
        let sql = format!(
            r#"
            INSERT INTO alerts (created_at, floor_id, variable, level, status, message, recommendation)
            VALUES ($1, $2, $3, $4, 'open', $5, $6)
            RETURNING {ALERT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(alert.created_at)
            .bind(alert.floor_id)
            .bind(alert.variable.as_str())
            .bind(alert.level.as_str())
            .bind(&alert.message)
            .bind(&alert.recommendation)
            .fetch_one(&self.pool)
            .await
            .context("alert INSERT failed")?;

        alert_from_row(&row)
    }

    async fn has_open_alert_since(
        &self,
        floor_id: i32,
        variable: Variable,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM alerts
                WHERE floor_id = $1 AND variable = $2 AND status = 'open' AND created_at >= $3
            )
            "#,
        )
        .bind(floor_id)
        .bind(variable.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .context("open alert lookup failed")?;

        Ok(exists)
    }

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("alert SELECT failed")?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn set_alert_status(&self, id: i64, status: AlertStatus) -> Result<Option<Alert>> {
        let sql = format!("UPDATE alerts SET status = $2 WHERE id = $1 RETURNING {ALERT_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("alert UPDATE failed")?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let sql = format!(
            r#"
            SELECT {ALERT_COLUMNS}
            FROM alerts
            WHERE ($1::int IS NULL OR floor_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.floor_id)
            .bind(filter.status.map(AlertStatus::as_str))
            .bind(filter.limit())
            .fetch_all(&self.pool)
            .await
            .context("alert list failed")?;

        rows.iter().map(alert_from_row).collect()
    }
}

// ------------------------------------------------------------------ //
//  Buildings and floors                                               //
// ------------------------------------------------------------------ //

#[async_trait]
impl Directory for PgStore {
    async fn list_buildings(&self) -> Result<Vec<Building>> {
        let rows = sqlx::query("SELECT id, name, address FROM buildings ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("building list failed")?;
        rows.iter().map(building_from_row).collect()
    }

    async fn get_building(&self, id: i32) -> Result<Option<Building>> {
        let row = sqlx::query("SELECT id, name, address FROM buildings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("building SELECT failed")?;
        row.as_ref().map(building_from_row).transpose()
    }

    async fn create_building(&self, building: NewBuilding) -> Result<Building> {
        let row = sqlx::query(
            "INSERT INTO buildings (name, address) VALUES ($1, $2) RETURNING id, name, address",
        )
        .bind(&building.name)
        .bind(&building.address)
        .fetch_one(&self.pool)
        .await
        .context("building INSERT failed")?;
        building_from_row(&row)
    }

    async fn find_building_by_name(&self, name: &str) -> Result<Option<Building>> {
        let row = sqlx::query("SELECT id, name, address FROM buildings WHERE name = $1 ORDER BY id LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("building lookup failed")?;
        row.as_ref().map(building_from_row).transpose()
    }

    async fn list_floors(&self) -> Result<Vec<Floor>> {
        let rows = sqlx::query("SELECT id, building_id, name, number FROM floors ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("floor list failed")?;
        rows.iter().map(floor_from_row).collect()
    }

    async fn get_floor(&self, id: i32) -> Result<Option<Floor>> {
        let row = sqlx::query("SELECT id, building_id, name, number FROM floors WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("floor SELECT failed")?;
        row.as_ref().map(floor_from_row).transpose()
    }

    async fn create_floor(&self, floor: NewFloor) -> Result<Floor> {
        let row = sqlx::query(
            r#"
            INSERT INTO floors (building_id, name, number)
            VALUES ($1, $2, $3)
            RETURNING id, building_id, name, number
            "#,
        )
        .bind(floor.building_id)
        .bind(&floor.name)
        .bind(floor.number)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                anyhow::Error::new(Conflict(format!(
                    "floor '{}' already exists in building {}",
                    floor.name, floor.building_id
                )))
            } else {
                anyhow::Error::new(e).context("floor INSERT failed")
            }
        })?;
        floor_from_row(&row)
    }

    async fn find_floor_by_number(&self, building_id: i32, number: i32) -> Result<Option<Floor>> {
        let row = sqlx::query(
            r#"
            SELECT id, building_id, name, number FROM floors
            WHERE building_id = $1 AND number = $2
            ORDER BY id LIMIT 1
            "#,
        )
        .bind(building_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await
        .context("floor lookup failed")?;
        row.as_ref().map(floor_from_row).transpose()
    }

    async fn delete_floor(&self, id: i32) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM floors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("floor DELETE failed")?
            .rows_affected();

        Ok(affected > 0)
    }
}
