//! SQLite storage layer: device registry and reputation ledger.
//!
//! Two tables back the pipeline's external-state reads:
//!
//! - `devices`: push tokens with last known positions, queried by the
//!   neighbor resolver. Registration lifecycle beyond upsert is owned by
//!   an external collaborator.
//! - `reputation`: per-user trust scores. Read-only from this core; the
//!   mutation ledger lives outside.
//!
//! Nothing alert-scoped is persisted here: events flow through the pipeline
//! and are discarded.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

/// One device row inside a bounding box, before great-circle filtering.
#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub token: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:beacon.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        // Token is the primary key: one row per device, so a single
        // resolution can never yield duplicate tokens.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for bounding-box prefilter queries
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_devices_lat_lng
            ON devices(latitude, longitude)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reputation (
                user_id TEXT PRIMARY KEY,
                score INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or refresh a device's token and position.
    pub async fn upsert_device(
        &self,
        user_id: &str,
        token: &str,
        latitude: f64,
        longitude: f64,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO devices (token, user_id, latitude, longitude, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(token) DO UPDATE SET
                user_id = excluded.user_id,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(token)
        .bind(user_id)
        .bind(latitude)
        .bind(longitude)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch device rows inside a latitude/longitude bounding box,
    /// excluding every device owned by `exclude_user_id`.
    ///
    /// This is the coarse prefilter; the resolver applies the exact
    /// great-circle distance on the returned rows. No antimeridian wrap
    /// handling: a 500 m box never spans it except within 500 m of the
    /// line itself.
    pub async fn devices_in_bbox(
        &self,
        min_lat: f64,
        max_lat: f64,
        min_lng: f64,
        max_lng: f64,
        exclude_user_id: &str,
    ) -> Result<Vec<DeviceRow>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT token, latitude, longitude
            FROM devices
            WHERE latitude BETWEEN ? AND ?
              AND longitude BETWEEN ? AND ?
              AND user_id != ?
            ORDER BY updated_at DESC
            "#,
        )
        .bind(min_lat)
        .bind(max_lat)
        .bind(min_lng)
        .bind(max_lng)
        .bind(exclude_user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| DeviceRow {
                token: r.get("token"),
                latitude: r.get("latitude"),
                longitude: r.get("longitude"),
            })
            .collect())
    }

    /// Read a user's current reputation score. Users with no ledger entry
    /// score 0 (the lowest band).
    pub async fn score_for(&self, user_id: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT score FROM reputation WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("score")).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_bbox_query() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        storage
            .upsert_device("U1", "tok-1", 10.0, 20.0, now)
            .await
            .unwrap();
        storage
            .upsert_device("U2", "tok-2", 10.001, 20.001, now)
            .await
            .unwrap();

        let rows = storage
            .devices_in_bbox(9.99, 10.01, 19.99, 20.01, "nobody")
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_bbox_excludes_user() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        storage
            .upsert_device("U1", "tok-reporter", 10.0, 20.0, now)
            .await
            .unwrap();
        storage
            .upsert_device("U2", "tok-neighbor", 10.0, 20.0, now)
            .await
            .unwrap();

        let rows = storage
            .devices_in_bbox(9.99, 10.01, 19.99, 20.01, "U1")
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token, "tok-neighbor");
    }

    #[tokio::test]
    async fn test_upsert_replaces_position() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        storage
            .upsert_device("U1", "tok-1", 10.0, 20.0, now)
            .await
            .unwrap();
        storage
            .upsert_device("U1", "tok-1", 50.0, 60.0, now)
            .await
            .unwrap();

        let old = storage
            .devices_in_bbox(9.0, 11.0, 19.0, 21.0, "nobody")
            .await
            .unwrap();
        assert!(old.is_empty());

        let new = storage
            .devices_in_bbox(49.0, 51.0, 59.0, 61.0, "nobody")
            .await
            .unwrap();
        assert_eq!(new.len(), 1);
    }

    #[tokio::test]
    async fn test_score_defaults_to_zero() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let score = storage.score_for("unknown").await.unwrap();
        assert_eq!(score, 0);

        sqlx::query("INSERT INTO reputation (user_id, score) VALUES (?, ?)")
            .bind("U1")
            .bind(72)
            .execute(&storage.pool)
            .await
            .unwrap();

        assert_eq!(storage.score_for("U1").await.unwrap(), 72);
    }
}
