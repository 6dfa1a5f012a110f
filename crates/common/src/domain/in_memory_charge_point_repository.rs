use crate::domain::{ChargePointRecord, ChargePointRepository, DomainResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Charge point registry held in memory.
///
/// Backs the static allow-list mode of the gateway and the tests.
#[derive(Clone, Default)]
pub struct InMemoryChargePointRepository {
    records: Arc<RwLock<HashMap<String, ChargePointRecord>>>,
}

impl InMemoryChargePointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry of active, password-less charge points.
    pub fn with_active_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = ids
            .into_iter()
            .map(|id| {
                let record = ChargePointRecord::active(id);
                (record.charge_point_id.clone(), record)
            })
            .collect();
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    pub async fn upsert(&self, record: ChargePointRecord) {
        let mut records = self.records.write().await;
        records.insert(record.charge_point_id.clone(), record);
    }

    pub async fn remove(&self, charge_point_id: &str) -> Option<ChargePointRecord> {
        let mut records = self.records.write().await;
        records.remove(charge_point_id)
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ChargePointRepository for InMemoryChargePointRepository {
    async fn get_charge_point(&self, charge_point_id: &str) -> DomainResult<Option<ChargePointRecord>> {
        let records = self.records.read().await;
        Ok(records.get(charge_point_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChargePointStatus;

    #[tokio::test]
    async fn test_lookup_of_known_and_unknown_ids() {
        let repo = InMemoryChargePointRepository::with_active_ids(["CP-001", "CP-002"]);

        let found = repo.get_charge_point("CP-001").await.unwrap();
        assert_eq!(found.map(|r| r.status), Some(ChargePointStatus::Active));
        assert!(repo.get_charge_point("CP-404").await.unwrap().is_none());
        assert_eq!(repo.count().await, 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_record() {
        let repo = InMemoryChargePointRepository::with_active_ids(["CP-001"]);
        repo.upsert(ChargePointRecord::active("CP-001").with_status(ChargePointStatus::Revoked))
            .await;

        let record = repo.get_charge_point("CP-001").await.unwrap().unwrap();
        assert_eq!(record.status, ChargePointStatus::Revoked);
        assert_eq!(repo.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let repo = InMemoryChargePointRepository::with_active_ids(["CP-001"]);
        assert!(repo.remove("CP-001").await.is_some());
        assert!(repo.get_charge_point("CP-001").await.unwrap().is_none());
    }
}
