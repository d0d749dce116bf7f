//! PostgreSQL log store

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::record::LogEvent;
use crate::worker::BatchWriter;

pub use crate::error::StoreError;

/// Row shape of the `logs` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub device_id: String,
    pub time: i64,
    pub text: String,
}

impl From<LogEvent> for LogRow {
    fn from(event: LogEvent) -> Self {
        Self {
            device_id: event.device_id,
            time: event.time,
            text: event.text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "Database pool created");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        debug!("Database migrations applied");
        Ok(())
    }

    /// One statement for the whole slice; rows already present are skipped.
    pub async fn insert_rows(&self, rows: &[LogRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new("INSERT INTO logs (device_id, time, text) ");
        query_builder.push_values(rows.iter(), |mut b, row| {
            b.push_bind(&row.device_id).push_bind(row.time).push_bind(&row.text);
        });
        query_builder.push(" ON CONFLICT DO NOTHING");

        let result = query_builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Delete rows whose device time is older than `cutoff` (Unix seconds).
    pub async fn delete_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM logs WHERE time < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs").fetch_one(&self.pool).await?;
        Ok(count)
    }
}

#[async_trait]
impl BatchWriter<LogRow> for PgLogStore {
    async fn write_batch(&mut self, records: &[LogRow]) -> Result<u64, StoreError> {
        self.insert_rows(records).await
    }
}
