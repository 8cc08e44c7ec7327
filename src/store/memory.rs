//! In-process contract store.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::ContractStore;
use crate::error::{Error, Result};
use crate::model::{Contract, ContractId};

/// HashMap-backed store with the same conditioned-write semantics as Postgres.
#[derive(Debug, Default)]
pub struct MemoryContractStore {
    records: Mutex<HashMap<ContractId, Contract>>,
}

impl MemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unconditional overwrite, for operator repair and crash simulation.
    pub fn replace(&self, contract: Contract) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(contract.id, contract);
    }
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn insert(&self, contract: &Contract) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&contract.id) {
            return Err(Error::Other(format!("contract {} already exists", contract.id)));
        }
        records.insert(contract.id, contract.clone());
        Ok(())
    }

    async fn get(&self, id: ContractId) -> Result<Contract> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    async fn compare_and_swap(&self, contract: &Contract, expected_version: u64) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = records
            .get_mut(&contract.id)
            .ok_or(Error::NotFound(contract.id))?;
        if stored.version != expected_version {
            return Err(Error::VersionConflict {
                id: contract.id,
                expected: expected_version,
            });
        }
        *stored = contract.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentRef, Submission};

    fn contract() -> Contract {
        Contract::received(
            Submission {
                document: DocumentRef {
                    uri: "s3://contracts/a.pdf".into(),
                    file_name: "a.pdf".into(),
                    content_type: "application/pdf".into(),
                    size_bytes: 1024,
                },
                organization_id: "acme".into(),
                submitted_by: "kelly".into(),
            },
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryContractStore::new();
        let original = contract();
        store.insert(&original).await.unwrap();

        let mut first = original.clone();
        first.version = 1;
        store.compare_and_swap(&first, 0).await.unwrap();

        let mut second = original.clone();
        second.version = 1;
        let err = store.compare_and_swap(&second, 0).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { expected: 0, .. }));
        assert_eq!(store.get(original.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn missing_contract_is_not_found() {
        let store = MemoryContractStore::new();
        let c = contract();
        assert!(matches!(store.get(c.id).await, Err(Error::NotFound(_))));
        assert!(matches!(
            store.compare_and_swap(&c, 0).await,
            Err(Error::NotFound(_))
        ));
    }
}
