//! Status mirror for escrow jobs and the loop that heals it against the ledger.

pub mod reconciler;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler, ReconcilerConfig, TickReport};
pub use store::{MemoryStatusStore, StatusStore, StoreError};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
