use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use escrow_core::enums::{PaymentStatus, Stage};
use escrow_core::ids::{JobId, TxHash};
use escrow_core::job::MirrorRecord;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("status store unavailable: {0}")]
    Unavailable(String),

    #[error("no status record for job {0}")]
    NotFound(JobId),
}

/// Persisted payment-status records, one row per job id.
///
/// `compare_and_set_status` is the only way to change a row's status and is
/// atomic per row. Rows are never deleted.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, job_id: JobId) -> Result<Option<MirrorRecord>, StoreError>;

    /// Inserts `record` unless a row already exists. Returns whether it was inserted.
    async fn insert_if_absent(&self, record: MirrorRecord) -> Result<bool, StoreError>;

    /// Moves the row from `expected` to `new`, optionally recording a stage
    /// hash in the same write. Returns false if the row is missing or its
    /// status is no longer `expected`.
    async fn compare_and_set_status(
        &self,
        job_id: JobId,
        expected: PaymentStatus,
        new: PaymentStatus,
        tx_hash: Option<(Stage, TxHash)>,
        now: u64,
    ) -> Result<bool, StoreError>;

    /// Overwrites the row with `record` while its status is still `none`.
    /// Returns false if the row is missing or has moved on.
    async fn replace_unfunded(&self, record: MirrorRecord) -> Result<bool, StoreError>;

    async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<MirrorRecord>, StoreError>;

    async fn flag_divergence(&self, job_id: JobId, note: &str, now: u64) -> Result<(), StoreError>;

    async fn all(&self) -> Result<Vec<MirrorRecord>, StoreError>;
}

/// In-memory store with row-level compare-and-set through DashMap entries.
#[derive(Clone, Default)]
pub struct MemoryStatusStore {
    records: Arc<DashMap<JobId, MirrorRecord>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from a snapshot.
    pub fn from_records(records: Vec<MirrorRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.job_id, record);
        }
        store
    }

    /// Every row ordered by job id.
    pub fn snapshot(&self) -> Vec<MirrorRecord> {
        let mut rows: Vec<MirrorRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|r| r.job_id);
        rows
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// While set, every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, job_id: JobId) -> Result<Option<MirrorRecord>, StoreError> {
        self.check_available()?;
        Ok(self.records.get(&job_id).map(|r| r.value().clone()))
    }

    async fn insert_if_absent(&self, record: MirrorRecord) -> Result<bool, StoreError> {
        self.check_available()?;
        match self.records.entry(record.job_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    async fn compare_and_set_status(
        &self,
        job_id: JobId,
        expected: PaymentStatus,
        new: PaymentStatus,
        tx_hash: Option<(Stage, TxHash)>,
        now: u64,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let Some(mut row) = self.records.get_mut(&job_id) else {
            return Ok(false);
        };
        if row.payment_status != expected {
            return Ok(false);
        }
        row.payment_status = new;
        if let Some((stage, hash)) = tx_hash {
            row.set_tx_hash(stage, hash);
        }
        row.updated_at = now;
        Ok(true)
    }

    async fn replace_unfunded(&self, record: MirrorRecord) -> Result<bool, StoreError> {
        self.check_available()?;
        let Some(mut row) = self.records.get_mut(&record.job_id) else {
            return Ok(false);
        };
        if row.payment_status != PaymentStatus::None {
            return Ok(false);
        }
        *row = record;
        Ok(true)
    }

    async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<MirrorRecord>, StoreError> {
        self.check_available()?;
        let mut rows: Vec<MirrorRecord> = self
            .records
            .iter()
            .filter(|r| r.payment_status == status)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.job_id);
        Ok(rows)
    }

    async fn flag_divergence(&self, job_id: JobId, note: &str, now: u64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut row = self
            .records
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        row.divergence = Some(note.to_string());
        row.updated_at = now;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<MirrorRecord>, StoreError> {
        self.check_available()?;
        Ok(self.snapshot())
    }
}
