//! Durable quota record storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use bulwark_core::CallerId;

use super::types::{DenyReason, QuotaRecord};

/// Read-modify-write applied to one record under the store's lock.
pub type RecordMutation = Box<dyn FnOnce(&mut QuotaRecord) -> Option<DenyReason> + Send>;

/// Quota record store.
///
/// `upsert_with` is the only write path: it creates the record from `create`
/// if the caller has none, then applies `mutate` atomically with respect to
/// every other `upsert_with` on the same caller.
#[async_trait]
pub trait QuotaStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, caller: &CallerId) -> Result<Option<QuotaRecord>, QuotaStoreError>;

    async fn upsert_with(
        &self,
        caller: &CallerId,
        create: QuotaRecord,
        mutate: RecordMutation,
    ) -> Result<(QuotaRecord, Option<DenyReason>), QuotaStoreError>;

    async fn list_callers(&self) -> Result<Vec<CallerId>, QuotaStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaStoreError {
    #[error("quota store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to decode quota record: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory quota store for tests/dev.
#[derive(Debug)]
pub struct InMemoryQuotaStore {
    records: Mutex<HashMap<CallerId, QuotaRecord>>,
    available: AtomicBool,
}

impl Default for InMemoryQuotaStore {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QuotaStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QuotaStoreError::Unavailable("in-memory store switched off".into()))
        }
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get(&self, caller: &CallerId) -> Result<Option<QuotaRecord>, QuotaStoreError> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(caller)
            .cloned())
    }

    async fn upsert_with(
        &self,
        caller: &CallerId,
        create: QuotaRecord,
        mutate: RecordMutation,
    ) -> Result<(QuotaRecord, Option<DenyReason>), QuotaStoreError> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(caller.clone()).or_insert(create);
        let verdict = mutate(record);
        Ok((record.clone(), verdict))
    }

    async fn list_callers(&self) -> Result<Vec<CallerId>, QuotaStoreError> {
        self.check_available()?;
        let mut callers: Vec<_> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        callers.sort();
        Ok(callers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::types::{Tier, TierTable};
    use chrono::Utc;

    #[tokio::test]
    async fn upsert_creates_then_mutates() {
        let store = InMemoryQuotaStore::new();
        let caller = CallerId::new("c1");
        let fresh = || QuotaRecord::new(caller.clone(), Tier::Free, TierTable::default().free, Utc::now());

        assert!(store.get(&caller).await.unwrap().is_none());

        let (record, verdict) = store
            .upsert_with(&caller, fresh(), Box::new(|r: &mut QuotaRecord| {
                r.daily.used += 1;
                None
            }))
            .await
            .unwrap();
        assert_eq!(record.daily.used, 1);
        assert!(verdict.is_none());

        // Existing record wins over the create template.
        let (record, _) = store
            .upsert_with(&caller, fresh(), Box::new(|r: &mut QuotaRecord| {
                r.daily.used += 1;
                None
            }))
            .await
            .unwrap();
        assert_eq!(record.daily.used, 2);
        assert_eq!(store.list_callers().await.unwrap(), vec![caller]);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryQuotaStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get(&CallerId::new("c")).await,
            Err(QuotaStoreError::Unavailable(_))
        ));
    }
}
