//! PostgreSQL transaction repository

use super::repository::{Mutation, TransactionRepository, TransactionStats};
use super::transaction::{BridgeTransaction, TransactionId, TransactionStatus, ValidatorSignature};
use crate::chain::{BridgeDirection, ChainId};
use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};

const COLUMNS: &str = r#"
    id, source_chain, destination_chain, source_address, destination_address,
    amount, fee, net_amount, status, validator_signatures,
    source_tx_hash, destination_tx_hash, refund_tx_hash,
    created_at, updated_at, completed_at, error_message,
    refund_attempts, requires_manual_intervention, idempotency_key
"#;

/// Repository backed by PostgreSQL. Amounts are stored as decimal text so
/// the full `u128` range survives.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a new repository
    pub async fn new(config: &DatabaseConfig) -> BridgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(BridgeError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> BridgeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_transactions (
                id UUID PRIMARY KEY,
                source_chain VARCHAR(20) NOT NULL,
                destination_chain VARCHAR(20) NOT NULL,
                source_address TEXT NOT NULL,
                destination_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL,
                net_amount TEXT NOT NULL,
                status VARCHAR(20) NOT NULL,
                validator_signatures JSONB NOT NULL DEFAULT '{}',
                source_tx_hash TEXT,
                destination_tx_hash TEXT,
                refund_tx_hash TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                error_message TEXT,
                refund_attempts INTEGER NOT NULL DEFAULT 0,
                requires_manual_intervention BOOLEAN NOT NULL DEFAULT FALSE,
                idempotency_key TEXT UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bridge_transactions_status
            ON bridge_transactions (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn decode(row: &PgRow) -> BridgeResult<BridgeTransaction> {
        let chain = |column: &str| -> BridgeResult<ChainId> {
            let value: String = row.try_get(column)?;
            value
                .parse()
                .map_err(|e: crate::error::ValidationError| BridgeError::Internal(e.to_string()))
        };
        let amount = |column: &str| -> BridgeResult<u128> {
            let value: String = row.try_get(column)?;
            value.parse().map_err(|_| {
                BridgeError::Internal(format!("corrupt {} column: {:?}", column, value))
            })
        };

        let status: String = row.try_get("status")?;
        let signatures: serde_json::Value = row.try_get("validator_signatures")?;
        let validator_signatures: BTreeMap<String, ValidatorSignature> =
            serde_json::from_value(signatures).map_err(|e| BridgeError::Internal(e.to_string()))?;

        Ok(BridgeTransaction {
            id: TransactionId(row.try_get("id")?),
            direction: BridgeDirection::new(chain("source_chain")?, chain("destination_chain")?),
            source_address: row.try_get("source_address")?,
            destination_address: row.try_get("destination_address")?,
            amount: amount("amount")?,
            fee: amount("fee")?,
            net_amount: amount("net_amount")?,
            status: status.parse().map_err(BridgeError::Internal)?,
            validator_signatures,
            source_tx_hash: row.try_get("source_tx_hash")?,
            destination_tx_hash: row.try_get("destination_tx_hash")?,
            refund_tx_hash: row.try_get("refund_tx_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            refund_attempts: row.try_get::<i32, _>("refund_attempts")? as u32,
            requires_manual_intervention: row.try_get("requires_manual_intervention")?,
            idempotency_key: row.try_get("idempotency_key")?,
        })
    }

    fn signatures_json(tx: &BridgeTransaction) -> BridgeResult<serde_json::Value> {
        serde_json::to_value(&tx.validator_signatures).map_err(|e| BridgeError::Internal(e.to_string()))
    }
}

#[async_trait]
impl TransactionRepository for PostgresRepository {
    async fn load(&self, id: TransactionId) -> BridgeResult<Option<BridgeTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM bridge_transactions WHERE id = $1",
            COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn save(&self, tx: &BridgeTransaction) -> BridgeResult<()> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO bridge_transactions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
            COLUMNS
        ))
        .bind(tx.id.0)
        .bind(tx.direction.source.as_str())
        .bind(tx.direction.destination.as_str())
        .bind(&tx.source_address)
        .bind(&tx.destination_address)
        .bind(tx.amount.to_string())
        .bind(tx.fee.to_string())
        .bind(tx.net_amount.to_string())
        .bind(tx.status.as_str())
        .bind(Self::signatures_json(tx)?)
        .bind(&tx.source_tx_hash)
        .bind(&tx.destination_tx_hash)
        .bind(&tx.refund_tx_hash)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.completed_at)
        .bind(&tx.error_message)
        .bind(tx.refund_attempts as i32)
        .bind(tx.requires_manual_intervention)
        .bind(&tx.idempotency_key)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(BridgeError::DuplicateTransaction {
                    key: tx.idempotency_key.clone().unwrap_or_else(|| tx.id.to_string()),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn compare_and_save(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        mutate: Mutation,
    ) -> BridgeResult<BridgeTransaction> {
        let mut db_tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM bridge_transactions WHERE id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&mut *db_tx)
        .await?
        .ok_or(BridgeError::TransactionNotFound { tx_id: id })?;

        let mut current = Self::decode(&row)?;
        if current.status != expected {
            // Dropping the transaction rolls it back
            return Err(BridgeError::StaleTransition {
                tx_id: id,
                expected,
                actual: current.status,
            });
        }

        mutate(&mut current)?;

        sqlx::query(
            r#"
            UPDATE bridge_transactions
            SET status = $2,
                validator_signatures = $3,
                source_tx_hash = $4,
                destination_tx_hash = $5,
                refund_tx_hash = $6,
                updated_at = $7,
                completed_at = $8,
                error_message = $9,
                refund_attempts = $10,
                requires_manual_intervention = $11
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(current.status.as_str())
        .bind(Self::signatures_json(&current)?)
        .bind(&current.source_tx_hash)
        .bind(&current.destination_tx_hash)
        .bind(&current.refund_tx_hash)
        .bind(current.updated_at)
        .bind(current.completed_at)
        .bind(&current.error_message)
        .bind(current.refund_attempts as i32)
        .bind(current.requires_manual_intervention)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        debug!("Saved {} as {}", id, current.status);
        Ok(current)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> BridgeResult<Option<BridgeTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM bridge_transactions WHERE idempotency_key = $1",
            COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_unresolved(&self) -> BridgeResult<Vec<BridgeTransaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM bridge_transactions
            WHERE status NOT IN ('COMPLETED', 'REFUNDED', 'FAILED')
               OR (status = 'FAILED'
                   AND source_tx_hash IS NOT NULL
                   AND NOT requires_manual_intervention)
            "#,
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn stats(&self) -> BridgeResult<TransactionStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'INITIATED') as initiated,
                COUNT(*) FILTER (WHERE status = 'LOCKED') as locked,
                COUNT(*) FILTER (WHERE status = 'VALIDATING') as validating,
                COUNT(*) FILTER (WHERE status = 'COMPLETING') as completing,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') as completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') as failed,
                COUNT(*) FILTER (WHERE status = 'REFUNDED') as refunded,
                COUNT(*) FILTER (WHERE requires_manual_intervention) as manual_intervention
            FROM bridge_transactions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TransactionStats {
            initiated: row.get::<i64, _>("initiated") as u64,
            locked: row.get::<i64, _>("locked") as u64,
            validating: row.get::<i64, _>("validating") as u64,
            completing: row.get::<i64, _>("completing") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            refunded: row.get::<i64, _>("refunded") as u64,
            manual_intervention: row.get::<i64, _>("manual_intervention") as u64,
        })
    }

    async fn health_check(&self) -> BridgeResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(BridgeError::Database)?;
        Ok(())
    }
}

// Needs a running PostgreSQL: DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FeeQuote;
    use chrono::{TimeZone, Utc};

    async fn repository() -> PostgresRepository {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            max_connections: 2,
            min_connections: 1,
        };
        let repo = PostgresRepository::new(&config).await.unwrap();
        repo.run_migrations().await.unwrap();
        repo
    }

    fn sample() -> BridgeTransaction {
        // Above i64::MAX so a numeric column would truncate it
        let amount = u128::MAX - 7;
        let mut tx = BridgeTransaction::new(
            BridgeDirection::new(ChainId::Polygon, ChainId::Vrty),
            "0xsender",
            "vrty1receiver",
            amount,
            FeeQuote {
                fee: 7,
                net_amount: amount - 7,
            },
            Some(format!("pg-{}", TransactionId::generate())),
        );
        // TIMESTAMPTZ keeps microseconds only
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        tx.created_at = at;
        tx.updated_at = at;
        tx
    }

    #[tokio::test]
    #[ignore]
    async fn test_record_survives_round_trip() {
        let repo = repository().await;
        let mut tx = sample();
        tx.status = TransactionStatus::Validating;
        tx.source_tx_hash = Some("0xlock".to_string());
        for (validator, signature) in [("0xv1", vec![0xde, 0xad]), ("0xv2", vec![0xbe, 0xef])] {
            tx.validator_signatures.insert(
                validator.to_string(),
                ValidatorSignature {
                    validator_address: validator.to_string(),
                    signature,
                    received_at: Utc.timestamp_opt(1_700_000_100, 123_456_789).unwrap(),
                },
            );
        }
        repo.save(&tx).await.unwrap();

        let loaded = repo.load(tx.id).await.unwrap().unwrap();
        assert_eq!(loaded, tx);
        assert_eq!(loaded.amount, u128::MAX - 7);

        let by_key = repo
            .find_by_idempotency_key(tx.idempotency_key.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, tx.id);

        let err = repo.save(&tx).await.unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateTransaction { .. }));
    }

    #[tokio::test]
    #[ignore]
    async fn test_compare_and_save_rejects_stale_status() {
        let repo = repository().await;
        let tx = sample();
        repo.save(&tx).await.unwrap();

        let err = repo
            .compare_and_save(
                tx.id,
                TransactionStatus::Validating,
                Box::new(|tx| {
                    tx.error_message = Some("should not land".to_string());
                    Ok(())
                }),
            )
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(repo.load(tx.id).await.unwrap().unwrap(), tx);

        // The rejected attempt released its row lock
        let updated = repo
            .compare_and_save(
                tx.id,
                TransactionStatus::Initiated,
                Box::new(|tx| {
                    tx.status = TransactionStatus::Locked;
                    tx.source_tx_hash = Some("0xlock".to_string());
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TransactionStatus::Locked);

        let stored = repo.load(tx.id).await.unwrap().unwrap();
        assert_eq!(stored, updated);
        assert!(repo
            .list_unresolved()
            .await
            .unwrap()
            .iter()
            .any(|t| t.id == tx.id));
    }
}
