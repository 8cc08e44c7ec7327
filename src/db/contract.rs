//! Contract records in Postgres: one JSONB document per contract plus the
//! `version` column the conditioned write tests against.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Contract, ContractId};
use crate::store::ContractStore;

#[derive(Clone)]
pub struct PgContractStore {
    pool: PgPool,
}

impl PgContractStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: ContractId) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM contracts WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ContractStore for PgContractStore {
    async fn insert(&self, contract: &Contract) -> Result<()> {
        let inserted = sqlx::query(
            "INSERT INTO contracts (id, organization_id, state, version, record, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(contract.id.0)
        .bind(&contract.organization_id)
        .bind(contract.state.as_str())
        .bind(contract.version as i64)
        .bind(Json(contract))
        .bind(contract.created_at)
        .bind(contract.updated_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(Error::Other(format!("contract {} already exists", contract.id)));
        }
        Ok(())
    }

    async fn get(&self, id: ContractId) -> Result<Contract> {
        let row: Option<(Json<Contract>,)> =
            sqlx::query_as("SELECT record FROM contracts WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(Json(contract),)| contract)
            .ok_or(Error::NotFound(id))
    }

    async fn compare_and_swap(&self, contract: &Contract, expected_version: u64) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE contracts
             SET state = $3, version = $4, record = $5, updated_at = $6
             WHERE id = $1 AND version = $2",
        )
        .bind(contract.id.0)
        .bind(expected_version as i64)
        .bind(contract.state.as_str())
        .bind(contract.version as i64)
        .bind(Json(contract))
        .bind(contract.updated_at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        if self.exists(contract.id).await? {
            Err(Error::VersionConflict {
                id: contract.id,
                expected: expected_version,
            })
        } else {
            Err(Error::NotFound(contract.id))
        }
    }
}
