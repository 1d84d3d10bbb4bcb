use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use escrow_core::job::MirrorRecord;
use reconciler::MemoryStatusStore;
use tokio::time::interval;

const SNAPSHOT_FILE: &str = "escrow_mirror.json";

pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_FILE)
}

/// Row counts of a snapshot, keyed by payment status.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub by_status: BTreeMap<&'static str, usize>,
    /// Rows still waiting on a ledger effect.
    pub in_flight: usize,
    pub divergent: usize,
}

impl SnapshotSummary {
    pub fn of(records: &[MirrorRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            *summary
                .by_status
                .entry(record.payment_status.as_str())
                .or_default() += 1;
            if record.payment_status.pending_stage().is_some() {
                summary.in_flight += 1;
            }
            if record.divergence.is_some() {
                summary.divergent += 1;
            }
        }
        summary
    }
}

/// Reads the snapshot at `path`. `Ok(None)` means there is nothing to restore.
pub fn read_snapshot(path: &Path) -> io::Result<Option<Vec<MirrorRecord>>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Restores the mirror from `path`. Without a usable snapshot the mirror
/// starts empty and the reconciler adopts ledger jobs as they are queried.
pub fn load_mirror(path: &Path) -> MemoryStatusStore {
    let records = match read_snapshot(path) {
        Ok(Some(records)) => records,
        Ok(None) => {
            tracing::info!(?path, "no mirror snapshot to restore");
            return MemoryStatusStore::new();
        }
        Err(e) => {
            tracing::warn!(?path, error = %e, "ignoring unreadable mirror snapshot");
            return MemoryStatusStore::new();
        }
    };

    let summary = SnapshotSummary::of(&records);
    tracing::info!(
        ?path,
        rows = records.len(),
        in_flight = summary.in_flight,
        divergent = summary.divergent,
        by_status = ?summary.by_status,
        "restored mirror rows"
    );
    if summary.in_flight > 0 {
        tracing::info!(in_flight = summary.in_flight, "in-flight rows will be rechecked on the first tick");
    }
    MemoryStatusStore::from_records(records)
}

/// Writes every row to `path` through a staging file. Returns the row count.
pub fn save_mirror(path: &Path, store: &MemoryStatusStore) -> io::Result<usize> {
    let rows = store.snapshot();
    let json = serde_json::to_vec_pretty(&rows).map_err(io::Error::other)?;

    let staging = path.with_extension("json.partial");
    std::fs::write(&staging, json)?;
    std::fs::rename(&staging, path)?;
    Ok(rows.len())
}

pub fn spawn_snapshot_task(store: MemoryStatusStore, path: PathBuf, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            match save_mirror(&path, &store) {
                Ok(rows) => tracing::debug!(rows, "mirror snapshot written"),
                Err(e) => tracing::warn!(?path, error = %e, "mirror snapshot write failed"),
            }
        }
    });
}
