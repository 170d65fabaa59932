//! PostgreSQL swap store

use super::OrderStore;
use crate::config::DatabaseConfig;
use crate::error::{SwapError, SwapResult};
use crate::model::SwapRecord;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

pub struct PgStore {
    pool: PgPool,
}

fn to_json(record: &SwapRecord) -> SwapResult<serde_json::Value> {
    serde_json::to_value(record)
        .map_err(|e| SwapError::Storage(format!("cannot encode order {}: {}", record.id(), e)))
}

fn from_json(value: serde_json::Value) -> SwapResult<SwapRecord> {
    serde_json::from_value(value).map_err(|e| SwapError::Storage(format!("corrupt record: {}", e)))
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> SwapResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    /// Create tables inline
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_orders (
                order_id VARCHAR(128) PRIMARY KEY,
                status VARCHAR(32) NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swap_orders_status
            ON swap_orders (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert(&self, record: &SwapRecord) -> SwapResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO swap_orders (order_id, status, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(record.id())
        .bind(record.order.status.as_str())
        .bind(to_json(record)?)
        .bind(record.order.created_at)
        .bind(record.order.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, order_id: &str) -> SwapResult<Option<SwapRecord>> {
        let row = sqlx::query("SELECT record FROM swap_orders WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| from_json(r.get::<serde_json::Value, _>("record")))
            .transpose()
    }

    async fn save(&self, record: &SwapRecord) -> SwapResult<()> {
        sqlx::query(
            r#"
            INSERT INTO swap_orders (order_id, status, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_id)
            DO UPDATE SET status = $2, record = $3, updated_at = $5
            "#,
        )
        .bind(record.id())
        .bind(record.order.status.as_str())
        .bind(to_json(record)?)
        .bind(record.order.created_at)
        .bind(record.order.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved order {} ({})", record.id(), record.order.status);
        Ok(())
    }

    async fn list_open(&self) -> SwapResult<Vec<SwapRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM swap_orders
            WHERE status NOT IN ('COMPLETED', 'CANCELLED')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| from_json(r.get::<serde_json::Value, _>("record")))
            .collect()
    }

    async fn health_check(&self) -> SwapResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::order::tests::input;
    use crate::model::{Order, Secret};
    use chrono::Utc;

    #[test]
    fn test_record_json_keeps_secret_and_amounts() {
        let mut record = SwapRecord::new(Order::from_input(input(), Utc::now(), 600).unwrap());
        record.revealed_secret = Some(Secret::new([9u8; 32]));

        let json = to_json(&record).unwrap();
        assert_eq!(json["order"]["makerAmount"], "1000000000000000000");
        let back = from_json(json).unwrap();
        assert_eq!(back.order, record.order);
        assert!(back
            .revealed_secret
            .unwrap()
            .matches(&record.order.secret_hash));
    }

    #[test]
    fn test_corrupt_record_is_storage_error() {
        let err = from_json(serde_json::json!({"order": 1})).unwrap_err();
        assert!(matches!(err, SwapError::Storage(_)));
    }
}
