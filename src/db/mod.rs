//! Postgres connection pool, migrations, and health check.
//!
//! The pool is shared by the contract store and the pgmq queue.

pub mod contract;
pub mod pgmq;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};

pub use contract::PgContractStore;
pub use pgmq::PgmqQueue;

/// Database handle. Owns the connection pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Contract store sharing this pool.
    pub fn contracts(&self) -> PgContractStore {
        PgContractStore::new(self.pool.clone())
    }

    /// Task queue sharing this pool.
    pub fn queues(&self) -> PgmqQueue {
        PgmqQueue::new(self.pool.clone())
    }
}
