//! PostgreSQL state manager

use super::{DeploymentStats, DeploymentStore};
use crate::config::DatabaseConfig;
use crate::error::{ChainErrorCategory, DeployerError, DeployerResult};
use crate::model::{
    ConfigurationStatus, DeploymentRecord, DeploymentStatus, LinkStatus, TokenConfiguration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

const RECORD_COLUMNS: &str = r#"
    configuration_id, chain_id, chain_name, status, contract_address, deployment_tx_id,
    attempt_count, last_attempt_at, last_error_category, last_error, completed_at,
    requires_link, link_status, link_tx_hub_to_peer, link_tx_peer_to_hub,
    link_attempt_count, link_error_category, link_error, ownership_tx_id,
    created_at, updated_at
"#;

const CONFIGURATION_COLUMNS: &str = r#"
    id, creator, name, symbol, decimals, total_supply, icon, chains,
    fee_payment_ref, status, error, created_at, updated_at
"#;

/// State manager for PostgreSQL persistence
pub struct PgStateManager {
    pool: PgPool,
}

impl PgStateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> DeployerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> DeployerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_configurations (
                id UUID PRIMARY KEY,
                creator VARCHAR(42) NOT NULL,
                name VARCHAR(64) NOT NULL,
                symbol VARCHAR(11) NOT NULL,
                decimals SMALLINT NOT NULL,
                total_supply TEXT NOT NULL,
                icon TEXT,
                chains TEXT[] NOT NULL,
                fee_payment_ref VARCHAR(66),
                status VARCHAR(20) NOT NULL,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_configurations_status
            ON token_configurations (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployment_records (
                configuration_id UUID NOT NULL
                    REFERENCES token_configurations (id) ON DELETE CASCADE,
                chain_id VARCHAR(64) NOT NULL,
                chain_name VARCHAR(128) NOT NULL,
                status VARCHAR(20) NOT NULL,
                contract_address VARCHAR(42),
                deployment_tx_id VARCHAR(66),
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TIMESTAMPTZ,
                last_error_category VARCHAR(20),
                last_error TEXT,
                completed_at TIMESTAMPTZ,
                requires_link BOOLEAN NOT NULL,
                link_status VARCHAR(20),
                link_tx_hub_to_peer VARCHAR(66),
                link_tx_peer_to_hub VARCHAR(66),
                link_attempt_count INTEGER NOT NULL DEFAULT 0,
                link_error_category VARCHAR(20),
                link_error TEXT,
                ownership_tx_id VARCHAR(66),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (configuration_id, chain_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_records_status
            ON deployment_records (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn insert_record(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &DeploymentRecord,
    ) -> DeployerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO deployment_records ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)",
            RECORD_COLUMNS
        ))
        .bind(record.configuration_id)
        .bind(&record.chain_id)
        .bind(&record.chain_name)
        .bind(record.status.as_str())
        .bind(&record.contract_address)
        .bind(&record.deployment_tx_id)
        .bind(record.attempt_count as i32)
        .bind(record.last_attempt_at)
        .bind(record.last_error_category.map(|c| c.as_str()))
        .bind(&record.last_error)
        .bind(record.completed_at)
        .bind(record.requires_link)
        .bind(record.link_status.map(|s| s.as_str()))
        .bind(&record.link_tx_hub_to_peer)
        .bind(&record.link_tx_peer_to_hub)
        .bind(record.link_attempt_count as i32)
        .bind(record.link_error_category.map(|c| c.as_str()))
        .bind(&record.link_error)
        .bind(&record.ownership_tx_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

fn parse_optional<T>(value: Option<String>) -> DeployerResult<Option<T>>
where
    T: std::str::FromStr<Err = DeployerError>,
{
    value.map(|v| v.parse()).transpose()
}

fn configuration_from_row(row: &PgRow) -> DeployerResult<TokenConfiguration> {
    let status: String = row.try_get("status")?;
    let decimals: i16 = row.try_get("decimals")?;

    Ok(TokenConfiguration {
        id: row.try_get("id")?,
        creator: row.try_get("creator")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        decimals: u8::try_from(decimals)
            .map_err(|_| DeployerError::Internal(format!("stored decimals {} out of range", decimals)))?,
        total_supply: row.try_get("total_supply")?,
        icon: row.try_get("icon")?,
        chains: row.try_get("chains")?,
        fee_payment_ref: row.try_get("fee_payment_ref")?,
        status: status.parse()?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> DeployerResult<DeploymentRecord> {
    let status: String = row.try_get("status")?;
    let attempt_count: i32 = row.try_get("attempt_count")?;
    let link_attempt_count: i32 = row.try_get("link_attempt_count")?;

    Ok(DeploymentRecord {
        configuration_id: row.try_get("configuration_id")?,
        chain_id: row.try_get("chain_id")?,
        chain_name: row.try_get("chain_name")?,
        status: status.parse()?,
        contract_address: row.try_get("contract_address")?,
        deployment_tx_id: row.try_get("deployment_tx_id")?,
        attempt_count: attempt_count.max(0) as u32,
        last_attempt_at: row.try_get::<Option<DateTime<Utc>>, _>("last_attempt_at")?,
        last_error_category: parse_optional::<ChainErrorCategory>(
            row.try_get("last_error_category")?,
        )?,
        last_error: row.try_get("last_error")?,
        completed_at: row.try_get("completed_at")?,
        requires_link: row.try_get("requires_link")?,
        link_status: parse_optional::<LinkStatus>(row.try_get("link_status")?)?,
        link_tx_hub_to_peer: row.try_get("link_tx_hub_to_peer")?,
        link_tx_peer_to_hub: row.try_get("link_tx_peer_to_hub")?,
        link_attempt_count: link_attempt_count.max(0) as u32,
        link_error_category: parse_optional::<ChainErrorCategory>(
            row.try_get("link_error_category")?,
        )?,
        link_error: row.try_get("link_error")?,
        ownership_tx_id: row.try_get("ownership_tx_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl DeploymentStore for PgStateManager {
    async fn health_check(&self) -> DeployerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_configuration(
        &self,
        configuration: &TokenConfiguration,
        records: &[DeploymentRecord],
    ) -> DeployerResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO token_configurations ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            CONFIGURATION_COLUMNS
        ))
        .bind(configuration.id)
        .bind(&configuration.creator)
        .bind(&configuration.name)
        .bind(&configuration.symbol)
        .bind(configuration.decimals as i16)
        .bind(&configuration.total_supply)
        .bind(&configuration.icon)
        .bind(&configuration.chains)
        .bind(&configuration.fee_payment_ref)
        .bind(configuration.status.as_str())
        .bind(&configuration.error)
        .bind(configuration.created_at)
        .bind(configuration.updated_at)
        .execute(&mut *tx)
        .await?;

        for record in records {
            Self::insert_record(&mut tx, record).await?;
        }

        tx.commit().await?;
        debug!(
            "Stored configuration {} with {} records",
            configuration.id,
            records.len()
        );
        Ok(())
    }

    async fn get_configuration(&self, id: Uuid) -> DeployerResult<Option<TokenConfiguration>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM token_configurations WHERE id = $1",
            CONFIGURATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(configuration_from_row).transpose()
    }

    async fn list_configurations_by_status(
        &self,
        status: ConfigurationStatus,
    ) -> DeployerResult<Vec<TokenConfiguration>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM token_configurations WHERE status = $1 ORDER BY created_at",
            CONFIGURATION_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(configuration_from_row).collect()
    }

    async fn attach_fee_payment(&self, id: Uuid, fee_payment_ref: &str) -> DeployerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE token_configurations
            SET fee_payment_ref = $2, updated_at = NOW()
            WHERE id = $1 AND fee_payment_ref IS NULL
            "#,
        )
        .bind(id)
        .bind(fee_payment_ref)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition_configuration(
        &self,
        id: Uuid,
        expected: ConfigurationStatus,
        next: ConfigurationStatus,
    ) -> DeployerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE token_configurations
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_configuration(id).await? {
            Some(_) => Ok(false),
            None => Err(DeployerError::configuration_not_found(id)),
        }
    }

    async fn update_aggregate(
        &self,
        id: Uuid,
        status: ConfigurationStatus,
        error: Option<&str>,
    ) -> DeployerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE token_configurations
            SET status = $2, error = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeployerError::configuration_not_found(id));
        }
        Ok(())
    }

    async fn get_record(
        &self,
        configuration_id: Uuid,
        chain_id: &str,
    ) -> DeployerResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deployment_records WHERE configuration_id = $1 AND chain_id = $2",
            RECORD_COLUMNS
        ))
        .bind(configuration_id)
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_records(&self, configuration_id: Uuid) -> DeployerResult<Vec<DeploymentRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deployment_records WHERE configuration_id = $1 ORDER BY chain_id",
            RECORD_COLUMNS
        ))
        .bind(configuration_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn compare_and_swap_record(
        &self,
        expected: DeploymentStatus,
        record: &DeploymentRecord,
    ) -> DeployerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deployment_records SET
                status = $4,
                contract_address = COALESCE(contract_address, $5),
                deployment_tx_id = $6,
                attempt_count = $7,
                last_attempt_at = $8,
                last_error_category = $9,
                last_error = $10,
                completed_at = $11,
                link_status = $12,
                link_tx_hub_to_peer = $13,
                link_tx_peer_to_hub = $14,
                link_attempt_count = $15,
                link_error_category = $16,
                link_error = $17,
                ownership_tx_id = COALESCE(ownership_tx_id, $18),
                updated_at = $19
            WHERE configuration_id = $1 AND chain_id = $2 AND status = $3
              AND (contract_address IS NULL OR contract_address = $5)
            "#,
        )
        .bind(record.configuration_id)
        .bind(&record.chain_id)
        .bind(expected.as_str())
        .bind(record.status.as_str())
        .bind(&record.contract_address)
        .bind(&record.deployment_tx_id)
        .bind(record.attempt_count as i32)
        .bind(record.last_attempt_at)
        .bind(record.last_error_category.map(|c| c.as_str()))
        .bind(&record.last_error)
        .bind(record.completed_at)
        .bind(record.link_status.map(|s| s.as_str()))
        .bind(&record.link_tx_hub_to_peer)
        .bind(&record.link_tx_peer_to_hub)
        .bind(record.link_attempt_count as i32)
        .bind(record.link_error_category.map(|c| c.as_str()))
        .bind(&record.link_error)
        .bind(&record.ownership_tx_id)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Tell a lost race apart from an attempt to replace the address
        let stored = self
            .get_record(record.configuration_id, &record.chain_id)
            .await?
            .ok_or_else(|| DeployerError::record_not_found(record.configuration_id, &record.chain_id))?;

        match stored.contract_address {
            Some(existing)
                if stored.status == expected
                    && record.contract_address.as_ref() != Some(&existing) =>
            {
                Err(DeployerError::ContractAddressConflict {
                    chain: record.chain_id.clone(),
                    existing,
                })
            }
            _ => Ok(false),
        }
    }

    async fn list_records_by_status(
        &self,
        statuses: &[DeploymentStatus],
    ) -> DeployerResult<Vec<DeploymentRecord>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deployment_records WHERE status = ANY($1) \
             ORDER BY configuration_id, chain_id",
            RECORD_COLUMNS
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_ownership_pending(&self) -> DeployerResult<Vec<DeploymentRecord>> {
        let statuses = vec![
            DeploymentStatus::Success.as_str().to_string(),
            DeploymentStatus::LinkSuccess.as_str().to_string(),
        ];
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deployment_records \
             WHERE status = ANY($1) AND contract_address IS NOT NULL AND ownership_tx_id IS NULL \
             AND configuration_id IN (SELECT id FROM token_configurations WHERE status = $2) \
             ORDER BY configuration_id, chain_id",
            RECORD_COLUMNS
        ))
        .bind(&statuses)
        .bind(ConfigurationStatus::Completed.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn get_stats(&self) -> DeployerResult<DeploymentStats> {
        let configurations: i64 = sqlx::query("SELECT COUNT(*) AS total FROM token_configurations")
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM deployment_records GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = DeploymentStats {
            configurations: configurations as u64,
            ..DeploymentStats::default()
        };
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            stats.add(status.parse()?, total.max(0) as u64);
        }

        Ok(stats)
    }
}
