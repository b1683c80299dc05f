use crate::codec::{RiskLevel, SensorReading};
use crate::config::DatabaseConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by the telemetry store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid database URL: {0}")]
    InvalidUrl(#[source] sqlx::Error),

    #[error("Failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

fn query_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { context, source }
}

/// Persisted sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SensorReadingRecord {
    /// Row ID, increasing in insertion order
    pub id: i64,
    pub temperature: f64,
    #[sqlx(try_from = "i64")]
    pub gas_level: u16,
    pub flame_detected: bool,
    /// When the backend stored the reading
    pub recorded_at: DateTime<Utc>,
}

impl SensorReadingRecord {
    pub fn reading(&self) -> SensorReading {
        SensorReading {
            temperature: self.temperature,
            gas_level: self.gas_level,
            flame_detected: self.flame_detected,
        }
    }
}

/// Persisted risk event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RiskEventRecord {
    /// Row ID, increasing in insertion order
    pub id: i64,
    #[sqlx(try_from = "i64")]
    pub risk_level: u8,
    /// When the backend stored the event
    pub recorded_at: DateTime<Utc>,
}

impl RiskEventRecord {
    pub fn level(&self) -> RiskLevel {
        RiskLevel(self.risk_level)
    }
}

/// Row counts per table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub sensor_readings: i64,
    pub risk_events: i64,
}

/// Append-only store of sensor readings and risk events backed by SQLite.
///
/// The pool is shared by the ingest worker and the API handlers; SQLite's own
/// locking (WAL plus a busy timeout) serializes writers.
pub struct TelemetryStore {
    pool: SqlitePool,
}

impl TelemetryStore {
    /// Open the database file, creating it if missing
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(StoreError::InvalidUrl)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        info!(url = %config.url, "Connected to SQLite database");

        Ok(Self { pool })
    }

    /// Private in-memory database. A single pinned connection keeps it alive.
    #[cfg(test)]
    pub(crate) async fn in_memory() -> Result<Self, StoreError> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::InvalidUrl)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Close the pool so every later call fails
    #[cfg(test)]
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    /// Create the telemetry tables if they do not exist yet
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn insert_sensor_reading(&self, reading: &SensorReading) -> Result<i64, StoreError> {
        let id = sqlx::query(
            r#"
            INSERT INTO sensor_readings (temperature, gas_level, flame_detected, recorded_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(reading.temperature)
        .bind(i64::from(reading.gas_level))
        .bind(reading.flame_detected)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(query_error("Failed to insert sensor reading"))?
        .last_insert_rowid();

        debug!(id, "Sensor reading stored");
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn insert_risk_event(&self, level: RiskLevel) -> Result<i64, StoreError> {
        let id = sqlx::query("INSERT INTO risk_events (risk_level, recorded_at) VALUES (?, ?)")
            .bind(i64::from(level.raw()))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(query_error("Failed to insert risk event"))?
            .last_insert_rowid();

        debug!(id, "Risk event stored");
        Ok(id)
    }

    /// Most recently inserted sensor reading, if any
    pub async fn latest_sensor_reading(&self) -> Result<Option<SensorReadingRecord>, StoreError> {
        sqlx::query_as::<_, SensorReadingRecord>(
            r#"
            SELECT id, temperature, gas_level, flame_detected, recorded_at
            FROM sensor_readings
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("Failed to query latest sensor reading"))
    }

    /// Most recently inserted risk event, if any
    pub async fn latest_risk_event(&self) -> Result<Option<RiskEventRecord>, StoreError> {
        sqlx::query_as::<_, RiskEventRecord>(
            r#"
            SELECT id, risk_level, recorded_at
            FROM risk_events
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("Failed to query latest risk event"))
    }

    /// Up to `limit` sensor readings, newest first
    #[instrument(skip(self))]
    pub async fn sensor_readings(
        &self,
        limit: u64,
    ) -> Result<Vec<SensorReadingRecord>, StoreError> {
        sqlx::query_as::<_, SensorReadingRecord>(
            r#"
            SELECT id, temperature, gas_level, flame_detected, recorded_at
            FROM sensor_readings
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("Failed to query sensor readings"))
    }

    /// Up to `limit` risk events, newest first
    #[instrument(skip(self))]
    pub async fn risk_events(&self, limit: u64) -> Result<Vec<RiskEventRecord>, StoreError> {
        sqlx::query_as::<_, RiskEventRecord>(
            r#"
            SELECT id, risk_level, recorded_at
            FROM risk_events
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("Failed to query risk events"))
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        sqlx::query_as::<_, StoreStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM sensor_readings) AS sensor_readings,
                (SELECT COUNT(*) FROM risk_events) AS risk_events
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("Failed to get store stats"))
    }

    /// Round-trip a trivial query (readiness probe)
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_error("Database ping failed"))?;
        Ok(())
    }
}

/// SQLite binds signed 64-bit integers; larger limits mean "everything"
fn sql_limit(limit: u64) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
