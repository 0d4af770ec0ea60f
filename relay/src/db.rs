use crate::errors::{Error, Result};
use crate::model::{Device, DeviceStatus, DeviceType, Reading};
use crate::store::{DevicePatch, DeviceStore, Mutation, Mutator, NewReading, ReadingStore, Upserted};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Optimistic-concurrency attempts before `atomic_upsert` gives up.
const MAX_UPSERT_ATTEMPTS: u32 = 8;

const DEVICE_COLUMNS: &str = "id, name, device_type, owner_id, pairing_token_hash, status, \
     created_at, last_seen, last_temperature, last_humidity, image_count, version";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    id: String,
    name: String,
    device_type: String,
    owner_id: String,
    pairing_token_hash: String,
    status: String,
    created_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_temperature: Option<f64>,
    last_humidity: Option<f64>,
    image_count: Option<i64>,
    version: i64,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        let device_type = row.device_type.parse::<DeviceType>().map_err(|e| {
            Error::StoreUnavailable(format!("corrupt device row {}: {}", row.id, e))
        })?;
        Ok(Device {
            id: row.id,
            name: row.name,
            device_type,
            owner_id: row.owner_id,
            pairing_token_hash: row.pairing_token_hash,
            status: DeviceStatus::parse(&row.status),
            created_at: row.created_at,
            last_seen: row.last_seen,
            last_temperature: row.last_temperature,
            last_humidity: row.last_humidity,
            image_count: row.image_count,
            version: row.version,
        })
    }
}

/// Postgres-backed device and reading store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self {
            pool: make_pool(database_url).await?,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_if_absent(&self, device: &Device) -> Result<Option<Device>> {
        let query = format!(
            "INSERT INTO devices (id, name, device_type, owner_id, pairing_token_hash, status, \
                 created_at, last_seen, last_temperature, last_humidity, image_count, version) \
             VALUES ($1, $2, $3, $4, $5, $6, now(), now(), $7, $8, $9, 1) \
             ON CONFLICT (id) DO NOTHING \
             RETURNING {}",
            DEVICE_COLUMNS
        );

        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(&device.id)
            .bind(&device.name)
            .bind(device.device_type.as_str())
            .bind(&device.owner_id)
            .bind(&device.pairing_token_hash)
            .bind(device.status.as_str())
            .bind(device.last_temperature)
            .bind(device.last_humidity)
            .bind(device.image_count)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Device::try_from).transpose()
    }

    // owner_id and device_type are immutable and never appear in the SET list
    async fn update_if_version(&self, device: &Device, expected_version: i64) -> Result<Option<Device>> {
        let query = format!(
            "UPDATE devices SET name = $2, status = $3, pairing_token_hash = $4, \
                 last_temperature = $5, last_humidity = $6, image_count = $7, \
                 version = version + 1 \
             WHERE id = $1 AND version = $8 \
             RETURNING {}",
            DEVICE_COLUMNS
        );

        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(&device.id)
            .bind(&device.name)
            .bind(device.status.as_str())
            .bind(&device.pairing_token_hash)
            .bind(device.last_temperature)
            .bind(device.last_humidity)
            .bind(device.image_count)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Device::try_from).transpose()
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn server_time(&self) -> Result<DateTime<Utc>> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }

    async fn get(&self, device_id: &str) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE id = $1", DEVICE_COLUMNS);
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Device::try_from).transpose()
    }

    async fn atomic_upsert(&self, device_id: &str, mutator: &mut Mutator<'_>) -> Result<Upserted> {
        for attempt in 1..=MAX_UPSERT_ATTEMPTS {
            let current = self.get(device_id).await?;
            let next = match mutator(current.as_ref()) {
                Mutation::Keep => return Ok(Upserted::Unchanged(current)),
                Mutation::Put(next) => next,
            };
            if next.id != device_id {
                return Err(Error::Validation(format!(
                    "Document key {} does not match device id {}",
                    device_id, next.id
                )));
            }

            let committed = match &current {
                None => self.insert_if_absent(&next).await?,
                Some(existing) => self.update_if_version(&next, existing.version).await?,
            };

            match committed {
                Some(device) => return Ok(Upserted::Written(device)),
                None => debug!(
                    "Concurrent write on device {} (attempt {}/{}), re-reading",
                    device_id, attempt, MAX_UPSERT_ATTEMPTS
                ),
            }
        }

        warn!(
            "Giving up on device {} after {} contended upsert attempts",
            device_id, MAX_UPSERT_ATTEMPTS
        );
        Err(Error::StoreUnavailable(format!(
            "too much contention on device {}",
            device_id
        )))
    }

    async fn write(&self, device_id: &str, patch: DevicePatch) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET
                name = COALESCE($2, name),
                status = COALESCE($3, status),
                last_temperature = COALESCE($4, last_temperature),
                last_humidity = COALESCE($5, last_humidity),
                last_seen = CASE WHEN $6::boolean THEN GREATEST(last_seen, now()) ELSE last_seen END,
                version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .bind(patch.name)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.last_temperature)
        .bind(patch.last_humidity)
        .bind(patch.touch_last_seen)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Device>> {
        let query = format!(
            "SELECT {} FROM devices WHERE owner_id = $1 ORDER BY created_at, id",
            DEVICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Device::try_from).collect()
    }

    async fn delete(&self, device_id: &str) -> Result<bool> {
        // readings go with it through ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn append(&self, device_id: &str, reading: NewReading) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO readings (device_id, ts, temperature, humidity)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (device_id, ts, temperature, humidity) DO NOTHING
            "#,
        )
        .bind(device_id)
        .bind(reading.timestamp)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23503") => {
                // foreign_key_violation: the parent device is gone
                Err(Error::DeviceNotFound(device_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recent(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>> {
        let readings = sqlx::query_as::<_, Reading>(
            r#"
            SELECT temperature, humidity, ts AS timestamp
            FROM readings
            WHERE device_id = $1
            ORDER BY ts DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(readings)
    }
}
