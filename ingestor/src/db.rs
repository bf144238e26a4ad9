use crate::config::StorageConfig;
use crate::errors::StorageError;
use crate::model::{
    format_timestamp, DeviceRecord, DeviceStatistics, Reading, Receipt, StoredReading,
};
use chrono::{SubsecRound, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable reading log plus per-device rollup, backed by SQLite.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Opens (creating if needed) the database file and applies migrations.
    pub async fn open(config: &StorageConfig) -> StorageResult<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        info!("Opening database at {}", config.database_path.display());
        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize().await?;
        Ok(storage)
    }

    /// Private in-memory database. A single pooled connection is kept alive
    /// for the lifetime of the pool, since each SQLite connection to
    /// `:memory:` sees its own database.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize().await?;
        Ok(storage)
    }

    /// Creates the reading log, the device table and their indexes. Safe to run repeatedly.
    pub async fn initialize(&self) -> StorageResult<()> {
        info!("Running database migrations...");
        MIGRATOR.run(&self.pool).await?;
        info!("Migrations completed");
        Ok(())
    }

    /// Appends the reading and updates its device rollup in one transaction.
    pub async fn persist(&self, reading: &Reading) -> StorageResult<Receipt> {
        // Truncated to the stored precision so the receipt matches what reads return.
        let received_at = Utc::now().trunc_subsecs(6);
        let received = format_timestamp(received_at);

        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sensor_data
                (device_id, device_type, location, temperature, humidity, light_level, voltage, timestamp, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(reading.device_id.as_str())
        .bind(&reading.device_type)
        .bind(&reading.location)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.light_level)
        .bind(reading.voltage)
        .bind(reading.timestamp.as_deref())
        .bind(&received)
        .fetch_one(&mut *tx)
        .await?;

        // last_seen only moves forward even if a concurrent, earlier-stamped
        // persist for the same device commits after this one.
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, device_type, location, first_seen, last_seen, total_records)
            VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT(device_id) DO UPDATE SET
                device_type = excluded.device_type,
                location = excluded.location,
                last_seen = MAX(devices.last_seen, excluded.last_seen),
                total_records = devices.total_records + 1
            "#,
        )
        .bind(reading.device_id.as_str())
        .bind(&reading.device_type)
        .bind(&reading.location)
        .bind(&received)
        .bind(&received)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("Stored reading {} for device {}", id, reading.device_id);
        Ok(Receipt { id, received_at })
    }

    /// Most recent readings first, optionally for a single device.
    pub async fn recent(&self, device_id: Option<&str>, limit: u32) -> StorageResult<Vec<StoredReading>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, device_id, device_type, location, temperature, humidity, light_level, voltage, timestamp, received_at FROM sensor_data",
        );

        if let Some(device_id) = device_id {
            query.push(" WHERE device_id = ").push_bind(device_id.to_string());
        }

        query
            .push(" ORDER BY received_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit));

        let readings = query
            .build_query_as::<StoredReading>()
            .fetch_all(&self.pool)
            .await?;

        Ok(readings)
    }

    /// Per-device aggregates computed from the reading log.
    pub async fn device_statistics(&self) -> StorageResult<Vec<DeviceStatistics>> {
        let stats = sqlx::query_as::<_, DeviceStatistics>(
            r#"
            SELECT
                device_id,
                COUNT(*) AS record_count,
                MIN(received_at) AS first_seen,
                MAX(received_at) AS last_seen,
                AVG(temperature) AS avg_temperature,
                AVG(humidity) AS avg_humidity,
                AVG(light_level) AS avg_light_level
            FROM sensor_data
            GROUP BY device_id
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(stats)
    }

    pub async fn device(&self, device_id: &str) -> StorageResult<Option<DeviceRecord>> {
        let device = sqlx::query_as::<_, DeviceRecord>(
            "SELECT device_id, device_type, location, first_seen, last_seen, total_records FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(device)
    }

    pub async fn devices(&self) -> StorageResult<Vec<DeviceRecord>> {
        let devices = sqlx::query_as::<_, DeviceRecord>(
            "SELECT device_id, device_type, location, first_seen, last_seen, total_records FROM devices ORDER BY last_seen DESC, device_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    pub async fn reading_count(&self) -> StorageResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
