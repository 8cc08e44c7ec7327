//! Document store collaborator.
//!
//! One record per contract, keyed by id. The only mutation after insert is a
//! conditioned replace: it succeeds only while the stored version still
//! equals the version the writer read.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Contract, ContractId};

pub use memory::MemoryContractStore;

#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Insert a new contract record.
    async fn insert(&self, contract: &Contract) -> Result<()>;

    /// Fetch a contract by id.
    async fn get(&self, id: ContractId) -> Result<Contract>;

    /// Replace the stored record if its version equals `expected_version`.
    ///
    /// Returns `Error::VersionConflict` when another writer got there first.
    async fn compare_and_swap(&self, contract: &Contract, expected_version: u64) -> Result<()>;
}
