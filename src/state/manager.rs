//! PostgreSQL trade store

use super::trade::{FailureCode, Quote, Trade, TradeId, TradeStats, TradeStatus};
use super::TradeStore;
use crate::config::DatabaseConfig;
use crate::error::{ForwarderError, ForwarderResult};
use crate::types::{Amount, SwapHash, SwapPreimage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

const TRADE_COLUMNS: &str = r#"
    id, hash,
    source_asset, source_unit, source_value,
    destination_asset, destination_unit, destination_value,
    start_time, end_time, preimage, failure_code
"#;

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> ForwarderResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> ForwarderResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id UUID PRIMARY KEY,
                hash BYTEA NOT NULL UNIQUE,
                source_asset VARCHAR(16) NOT NULL,
                source_unit VARCHAR(16) NOT NULL,
                source_value BIGINT NOT NULL,
                destination_asset VARCHAR(16) NOT NULL,
                destination_unit VARCHAR(16) NOT NULL,
                destination_value BIGINT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ,
                preimage BYTEA,
                failure_code VARCHAR(32)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_trades_pending
            ON trades (start_time) WHERE end_time IS NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Distinguish a missing row from an already-finalized one after a gated update
    async fn finalize_failed(&self, id: TradeId) -> ForwarderError {
        match self.get_trade(id).await {
            Ok(_) => ForwarderError::TradeFinalized {
                trade_id: id.to_string(),
            },
            Err(e) => e,
        }
    }
}

fn to_db_value(value: u64) -> ForwarderResult<i64> {
    i64::try_from(value)
        .map_err(|_| ForwarderError::Internal(format!("amount {} exceeds BIGINT", value)))
}

fn amount_from_row(row: &PgRow, prefix: &str) -> ForwarderResult<Amount> {
    let value: i64 = row.try_get(format!("{}_value", prefix).as_str())?;
    let value = u64::try_from(value)
        .map_err(|_| ForwarderError::Internal(format!("negative {} amount", prefix)))?;
    Ok(Amount::new(
        row.try_get::<String, _>(format!("{}_asset", prefix).as_str())?,
        row.try_get::<String, _>(format!("{}_unit", prefix).as_str())?,
        value,
    ))
}

fn trade_from_row(row: &PgRow) -> ForwarderResult<Trade> {
    let hash: Vec<u8> = row.try_get("hash")?;
    let hash = SwapHash::from_slice(&hash).map_err(|e| ForwarderError::Internal(e.to_string()))?;

    let preimage: Option<Vec<u8>> = row.try_get("preimage")?;
    let preimage = preimage
        .map(|p| SwapPreimage::from_slice(&p))
        .transpose()
        .map_err(|e| ForwarderError::Internal(e.to_string()))?;

    let failure_code: Option<String> = row.try_get("failure_code")?;
    let failure_code = failure_code
        .map(|c| c.parse::<FailureCode>())
        .transpose()
        .map_err(ForwarderError::Internal)?;

    Ok(Trade {
        id: row.try_get("id")?,
        hash,
        source_amount: amount_from_row(row, "source")?,
        destination_amount: amount_from_row(row, "destination")?,
        start_time: row.try_get::<DateTime<Utc>, _>("start_time")?,
        end_time: row.try_get::<Option<DateTime<Utc>>, _>("end_time")?,
        preimage,
        failure_code,
    })
}

#[async_trait]
impl TradeStore for StateManager {
    async fn create_trade(&self, quote: &Quote) -> ForwarderResult<TradeId> {
        let trade = Trade::new(quote.clone(), Utc::now());

        sqlx::query(
            r#"
            INSERT INTO trades
                (id, hash, source_asset, source_unit, source_value,
                 destination_asset, destination_unit, destination_value, start_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(trade.id)
        .bind(&trade.hash.as_bytes()[..])
        .bind(trade.source_amount.asset())
        .bind(trade.source_amount.unit())
        .bind(to_db_value(trade.source_amount.value())?)
        .bind(trade.destination_amount.asset())
        .bind(trade.destination_amount.unit())
        .bind(to_db_value(trade.destination_amount.value())?)
        .bind(trade.start_time)
        .execute(&self.pool)
        .await?;

        debug!(trade_id = %trade.id, hash = %trade.hash, "Stored trade");
        Ok(trade.id)
    }

    async fn get_trade(&self, id: TradeId) -> ForwarderResult<Trade> {
        let row = sqlx::query(&format!("SELECT {} FROM trades WHERE id = $1", TRADE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ForwarderError::TradeNotFound {
                trade_id: id.to_string(),
            })?;

        trade_from_row(&row)
    }

    async fn get_pending_trades(&self) -> ForwarderResult<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trades WHERE end_time IS NULL ORDER BY start_time",
            TRADE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn list_trades(&self, limit: u32) -> ForwarderResult<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trades ORDER BY start_time DESC LIMIT $1",
            TRADE_COLUMNS
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn mark_complete(
        &self,
        id: TradeId,
        hash: &SwapHash,
        preimage: &SwapPreimage,
    ) -> ForwarderResult<()> {
        if !preimage.matches(hash) {
            return Err(ForwarderError::Internal(format!(
                "preimage does not match hash {} for trade {}",
                hash, id
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE trades SET end_time = NOW(), preimage = $3
            WHERE id = $1 AND hash = $2 AND end_time IS NULL
            "#,
        )
        .bind(id)
        .bind(&hash.as_bytes()[..])
        .bind(&preimage.as_bytes()[..])
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.finalize_failed(id).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: TradeId, failure_code: FailureCode) -> ForwarderResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE trades SET end_time = NOW(), failure_code = $2
            WHERE id = $1 AND end_time IS NULL
            "#,
        )
        .bind(id)
        .bind(failure_code.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.finalize_failed(id).await);
        }
        Ok(())
    }

    async fn stats(&self) -> ForwarderResult<TradeStats> {
        let rows = sqlx::query(
            r#"
            SELECT
                end_time IS NULL AS pending,
                preimage IS NOT NULL AS complete,
                failure_code IS NOT NULL AS failed,
                COUNT(*) AS count
            FROM trades
            GROUP BY 1, 2, 3
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TradeStats::default();
        for row in rows {
            let count = u64::try_from(row.try_get::<i64, _>("count")?).unwrap_or(0);
            let status = if row.try_get::<bool, _>("pending")? {
                TradeStatus::Pending
            } else if row.try_get::<bool, _>("complete")? {
                TradeStatus::Complete
            } else if row.try_get::<bool, _>("failed")? {
                TradeStatus::Failed
            } else {
                TradeStatus::Unknown
            };
            stats.add_many(status, count);
        }

        Ok(stats)
    }

    async fn health_check(&self) -> ForwarderResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
