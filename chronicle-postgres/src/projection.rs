//! PostgreSQL-backed [`ProjectionStore`]: one row per projection in the
//! `projections` table (see `migrations/V1__registry.sql`), with positions
//! kept as a JSONB map and status as a short text code.

use std::collections::HashMap;

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::NoTls;

use chronicle::error::ProjectionError;
use chronicle::projection::{ProjectionRecord, ProjectionStatus, ProjectionStore};

fn status_to_code(status: ProjectionStatus) -> &'static str {
    match status {
        ProjectionStatus::Idle => "idle",
        ProjectionStatus::Running => "running",
        ProjectionStatus::Stopping => "stopping",
        ProjectionStatus::Deleting => "deleting",
        ProjectionStatus::Resetting => "resetting",
    }
}

fn code_to_status(code: &str) -> ProjectionStatus {
    match code {
        "running" => ProjectionStatus::Running,
        "stopping" => ProjectionStatus::Stopping,
        "deleting" => ProjectionStatus::Deleting,
        "resetting" => ProjectionStatus::Resetting,
        _ => ProjectionStatus::Idle,
    }
}

fn store_err(err: impl Into<anyhow::Error>) -> ProjectionError {
    ProjectionError::Store(chronicle::error::StoreError::Internal(err.into()))
}

/// PostgreSQL-backed [`ProjectionStore`], sharing its connection pool with a
/// [`crate::PgEventStore`].
#[derive(Clone)]
pub struct PgProjectionStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PgProjectionStore {
    pub fn new(pool: Pool<PostgresConnectionManager<NoTls>>) -> Self {
        PgProjectionStore { pool }
    }

    fn record_from_row(name: &str, position: serde_json::Value, status: &str) -> Result<ProjectionRecord, ProjectionError> {
        let positions: HashMap<String, u64> =
            serde_json::from_value(position).map_err(store_err)?;
        Ok(ProjectionRecord {
            name: name.to_string(),
            status: code_to_status(status),
            positions,
        })
    }
}

#[async_trait]
impl ProjectionStore for PgProjectionStore {
    async fn ensure(&self, name: &str) -> Result<ProjectionRecord, ProjectionError> {
        let conn = self.pool.get().await.map_err(store_err)?;
        conn.execute(
            "INSERT INTO projections (name, position, status) VALUES ($1, '{}'::jsonb, 'idle') \
             ON CONFLICT (name) DO NOTHING",
            &[&name],
        )
        .await
        .map_err(store_err)?;

        self.fetch(name)
            .await?
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))
    }

    async fn fetch(&self, name: &str) -> Result<Option<ProjectionRecord>, ProjectionError> {
        let conn = self.pool.get().await.map_err(store_err)?;
        let row = conn
            .query_opt(
                "SELECT position, status FROM projections WHERE name = $1",
                &[&name],
            )
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let position: serde_json::Value = row.get(0);
                let status: String = row.get(1);
                Ok(Some(Self::record_from_row(name, position, &status)?))
            }
            None => Ok(None),
        }
    }

    async fn set_status(&self, name: &str, status: ProjectionStatus) -> Result<(), ProjectionError> {
        let conn = self.pool.get().await.map_err(store_err)?;
        let updated = conn
            .execute(
                "UPDATE projections SET status = $2 WHERE name = $1",
                &[&name, &status_to_code(status)],
            )
            .await
            .map_err(store_err)?;
        if updated == 0 {
            return Err(ProjectionError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn set_position(&self, name: &str, stream_name: &str, position: u64) -> Result<(), ProjectionError> {
        let conn = self.pool.get().await.map_err(store_err)?;
        let updated = conn
            .execute(
                "UPDATE projections SET position = jsonb_set(position, ARRAY[$2]::text[], to_jsonb($3::bigint), true) \
                 WHERE name = $1",
                &[&name, &stream_name, &(position as i64)],
            )
            .await
            .map_err(store_err)?;
        if updated == 0 {
            return Err(ProjectionError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn reset(&self, name: &str) -> Result<(), ProjectionError> {
        let record = self
            .fetch(name)
            .await?
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
        let zeroed: HashMap<String, u64> = record.positions.into_keys().map(|k| (k, 0)).collect();
        let zeroed_json = serde_json::to_value(zeroed).expect("map of u64 always serializes");

        let conn = self.pool.get().await.map_err(store_err)?;
        let updated = conn
            .execute(
                "UPDATE projections SET position = $2 WHERE name = $1",
                &[&name, &zeroed_json],
            )
            .await
            .map_err(store_err)?;
        if updated == 0 {
            return Err(ProjectionError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProjectionError> {
        let conn = self.pool.get().await.map_err(store_err)?;
        conn.execute("DELETE FROM projections WHERE name = $1", &[&name])
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn fetch_names(&self, limit: u64, offset: u64) -> Result<Vec<String>, ProjectionError> {
        let conn = self.pool.get().await.map_err(store_err)?;
        let rows = if limit == 0 {
            conn.query(
                "SELECT name FROM projections ORDER BY name OFFSET $1",
                &[&(offset as i64)],
            )
            .await
        } else {
            conn.query(
                "SELECT name FROM projections ORDER BY name OFFSET $1 LIMIT $2",
                &[&(offset as i64), &(limit as i64)],
            )
            .await
        }
        .map_err(store_err)?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }
}
