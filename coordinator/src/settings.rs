//! Coordinator settings.
//!
//! Loaded once at startup from environment variables (after `.env` has been
//! applied by `dotenvy`). Secrets are not part of this struct; see
//! [`crate::secrets`].
//!
//! | Env var                   | Default                                      |
//! |---------------------------|----------------------------------------------|
//! | `COORDINATOR_ADDR`        | `0.0.0.0:8080`                               |
//! | `DB_MAX_CONNECTIONS`      | `10`                                         |
//! | `POSTGRES_USER`           | `postgres`                                   |
//! | `POSTGRES_PASSWORD`       | `postgres`                                   |
//! | `POSTGRES_DB`             | `mydb`                                       |
//! | `POSTGRES_HOST`           | `localhost`                                  |
//! | `POSTGRES_PORT`           | `5432`                                       |
//! | `GEMINI_MODEL`            | `gemini-1.5-flash`                           |
//! | `GEMINI_API_URL`          | `https://generativelanguage.googleapis.com`  |
//! | `GENERATOR_TIMEOUT_SECS`  | `8`                                          |
//! | `DEDUP_WINDOW_MINUTES`    | `30`                                         |
//! | `TREND_LOOKBACK_MINUTES`  | `120`                                        |
//! | `DEFAULT_ENERGY_LOWER`    | `0`                                          |
//! | `DEFAULT_ENERGY_UPPER`    | `10`                                         |

use std::time::Duration;

use alert_engine::dedup::DEFAULT_WINDOW_MINUTES;
use alert_engine::generator::DEFAULT_GEMINI_API_URL;
use alert_engine::lifecycle::DEFAULT_TREND_LOOKBACK_MINUTES;
use alert_engine::threshold::Band;
use alert_engine::{EngineConfig, ThresholdDefaults};
use anyhow::{bail, Context, Result};
use config::{Config, Environment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator_addr: String,
    pub db_max_connections: u32,

    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_db: String,
    pub postgres_host: String,
    pub postgres_port: u16,

    pub gemini_model: String,
    pub gemini_api_url: String,
    pub generator_timeout_secs: u64,

    pub dedup_window_minutes: i64,
    pub trend_lookback_minutes: i64,
    pub default_energy_lower: f64,
    pub default_energy_upper: f64,
}

impl Settings {
    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_environment(Environment::default())
    }

    /// Load from an explicit variable map instead of the process environment.
    #[cfg(test)]
    fn from_map(vars: std::collections::HashMap<String, String>) -> Result<Self> {
        Self::from_environment(Environment::default().source(Some(vars)))
    }

    fn from_environment(env: Environment) -> Result<Self> {
        let settings: Settings = Config::builder()
            .set_default("coordinator_addr", "0.0.0.0:8080")?
            .set_default("db_max_connections", 10)?
            .set_default("postgres_user", "postgres")?
            .set_default("postgres_password", "postgres")?
            .set_default("postgres_db", "mydb")?
            .set_default("postgres_host", "localhost")?
            .set_default("postgres_port", 5432)?
            .set_default("gemini_model", "gemini-1.5-flash")?
            .set_default("gemini_api_url", DEFAULT_GEMINI_API_URL)?
            .set_default("generator_timeout_secs", 8)?
            .set_default("dedup_window_minutes", DEFAULT_WINDOW_MINUTES)?
            .set_default("trend_lookback_minutes", DEFAULT_TREND_LOOKBACK_MINUTES)?
            .set_default("default_energy_lower", 0.0)?
            .set_default("default_energy_upper", 10.0)?
            .add_source(env.try_parsing(true))
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.default_energy_lower > self.default_energy_upper {
            bail!(
                "DEFAULT_ENERGY_LOWER ({}) is above DEFAULT_ENERGY_UPPER ({})",
                self.default_energy_lower,
                self.default_energy_upper
            );
        }
        if self.dedup_window_minutes <= 0 {
            bail!("DEDUP_WINDOW_MINUTES must be positive");
        }
        if self.trend_lookback_minutes <= 0 {
            bail!("TREND_LOOKBACK_MINUTES must be positive");
        }
        if self.generator_timeout_secs == 0 {
            bail!("GENERATOR_TIMEOUT_SECS must be positive");
        }
        Ok(())
    }

    /// Connection string assembled from the `POSTGRES_*` parts, used when no
    /// `DATABASE_URL` secret is available.
    pub fn composed_database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_host,
            self.postgres_port,
            self.postgres_db
        )
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            thresholds: ThresholdDefaults {
                energy: Band::new(self.default_energy_lower, self.default_energy_upper),
                ..ThresholdDefaults::default()
            },
            dedup_window: chrono::Duration::minutes(self.dedup_window_minutes),
            trend_lookback: chrono::Duration::minutes(self.trend_lookback_minutes),
        }
    }
}
