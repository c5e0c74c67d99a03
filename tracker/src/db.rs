use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Device, DeviceCategory, LocationSample, Position};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
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
    user_id: String,
    name: String,
    device_type: String,
    last_lat: Option<f64>,
    last_lng: Option<f64>,
    last_seen: Option<DateTime<Utc>>,
    battery_level: Option<f64>,
    created_at: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        let position = match (row.last_lat, row.last_lng) {
            (Some(lat), Some(lng)) => Some(Position::new(lat, lng)),
            _ => None,
        };
        Self {
            id: row.id,
            owner_id: row.user_id,
            name: row.name,
            category: DeviceCategory::from(row.device_type),
            position,
            last_seen: row.last_seen,
            battery: row.battery_level,
            registered_at: row.created_at,
        }
    }
}

/// Reads every device in registration order, for seeding the registry.
pub async fn load_devices(pool: &PgPool) -> Result<Vec<Device>> {
    let rows = sqlx::query_as::<_, DeviceRow>(
        r#"
        SELECT id, user_id, name, device_type, last_lat, last_lng, last_seen, battery_level, created_at
        FROM devices
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    info!("Loaded {} devices from database", rows.len());
    Ok(rows.into_iter().map(Device::from).collect())
}

pub async fn insert_batch(pool: &PgPool, batch: &[LocationSample]) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut attempts = 0;
    let max_attempts = 5;

    loop {
        attempts += 1;
        match insert_batch_inner(pool, batch).await {
            Ok(()) => return Ok(()),
            Err(e) => match &e {
                Error::Database(db_err) => {
                    DB_FAILURES_TOTAL.inc();
                    if attempts >= max_attempts || !is_transient_error(db_err) {
                        error!(
                            "Database archive failed permanently after {} attempts: {}",
                            attempts, e
                        );
                        return Err(e);
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database archive failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                _ => {
                    error!("Database archive failed with non-database error: {}", e);
                    return Err(e);
                }
            },
        }
    }
}

/// Newest sample per device within a batch.
fn latest_per_device(batch: &[LocationSample]) -> Vec<&LocationSample> {
    let mut latest: HashMap<&str, &LocationSample> = HashMap::new();
    for sample in batch {
        latest
            .entry(sample.device_id.as_str())
            .and_modify(|current| {
                if sample.timestamp > current.timestamp {
                    *current = sample;
                }
            })
            .or_insert(sample);
    }
    latest.into_values().collect()
}

async fn insert_batch_inner(pool: &PgPool, batch: &[LocationSample]) -> Result<()> {
    let device_ids: Vec<&str> = batch.iter().map(|s| s.device_id.as_str()).collect();
    let lats: Vec<f64> = batch.iter().map(|s| s.lat).collect();
    let lngs: Vec<f64> = batch.iter().map(|s| s.lng).collect();
    let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|s| s.timestamp).collect();
    let accuracies: Vec<Option<f64>> = batch.iter().map(|s| s.accuracy).collect();
    let batteries: Vec<Option<f64>> = batch.iter().map(|s| s.battery).collect();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO device_locations (device_id, lat, lng, ts, accuracy, battery_level)
        SELECT * FROM UNNEST($1::text[], $2::float8[], $3::float8[], $4::timestamptz[], $5::float8[], $6::float8[])
        ON CONFLICT (device_id, ts) DO NOTHING
        "#,
    )
    .bind(&device_ids)
    .bind(&lats)
    .bind(&lngs)
    .bind(&timestamps)
    .bind(&accuracies)
    .bind(&batteries)
    .execute(&mut *tx)
    .await?;

    let latest = latest_per_device(batch);
    let latest_ids: Vec<&str> = latest.iter().map(|s| s.device_id.as_str()).collect();
    let latest_lats: Vec<f64> = latest.iter().map(|s| s.lat).collect();
    let latest_lngs: Vec<f64> = latest.iter().map(|s| s.lng).collect();
    let latest_ts: Vec<DateTime<Utc>> = latest.iter().map(|s| s.timestamp).collect();
    let latest_batteries: Vec<Option<f64>> = latest.iter().map(|s| s.battery).collect();

    sqlx::query(
        r#"
        UPDATE devices AS d
        SET last_lat = u.lat,
            last_lng = u.lng,
            last_seen = u.ts,
            battery_level = COALESCE(u.battery, d.battery_level),
            updated_at = now()
        FROM UNNEST($1::text[], $2::float8[], $3::float8[], $4::timestamptz[], $5::float8[])
            AS u(device_id, lat, lng, ts, battery)
        WHERE d.id = u.device_id AND (d.last_seen IS NULL OR d.last_seen < u.ts)
        "#,
    )
    .bind(&latest_ids)
    .bind(&latest_lats)
    .bind(&latest_lngs)
    .bind(&latest_ts)
    .bind(&latest_batteries)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-related SQLSTATE codes
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
