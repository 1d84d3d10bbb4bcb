use alloy_primitives::{Address, U256};
use escrow_core::enums::{PaymentStatus, Stage};
use escrow_core::ids::{JobId, TxHash};
use escrow_core::job::MirrorRecord;
use gateway::persistence::{load_mirror, read_snapshot, save_mirror, snapshot_path, SnapshotSummary};
use reconciler::{MemoryStatusStore, StatusStore};

fn record(id: u64) -> MirrorRecord {
    MirrorRecord::new(
        JobId(id),
        Address::repeat_byte(0xa1),
        Address::repeat_byte(0xb2),
        U256::from(100_000_000_000u64),
        1_700_000_000,
    )
}

#[tokio::test]
async fn snapshot_restores_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = snapshot_path(dir.path());

    let store = MemoryStatusStore::new();
    store.insert_if_absent(record(1)).await.unwrap();
    store.insert_if_absent(record(2)).await.unwrap();
    store
        .compare_and_set_status(
            JobId(2),
            PaymentStatus::None,
            PaymentStatus::DepositInitiated,
            Some((Stage::Deposit, TxHash([7; 32]))),
            1_700_000_100,
        )
        .await
        .unwrap();
    store
        .flag_divergence(JobId(2), "deposit never landed", 1_700_000_200)
        .await
        .unwrap();

    assert_eq!(save_mirror(&path, &store).unwrap(), 2);
    assert!(!path.with_extension("json.partial").exists());

    let restored = load_mirror(&path);
    assert_eq!(restored.snapshot(), store.snapshot());

    let row = restored.get(JobId(2)).await.unwrap().unwrap();
    assert_eq!(row.payment_status, PaymentStatus::DepositInitiated);
    assert_eq!(row.tx_hash_deposit, Some(TxHash([7; 32])));
    assert_eq!(row.divergence.as_deref(), Some("deposit never landed"));
}

#[test]
fn missing_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = load_mirror(&snapshot_path(dir.path()));
    assert!(store.is_empty());
}

#[test]
fn corrupt_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = snapshot_path(dir.path());
    std::fs::write(&path, "{not json").unwrap();

    assert!(load_mirror(&path).is_empty());
}

#[test]
fn snapshot_is_human_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = snapshot_path(dir.path());
    let store = MemoryStatusStore::from_records(vec![record(5)]);

    save_mirror(&path, &store).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"payment_status\": \"none\""));
    assert!(text.contains("\"job_id\": 5"));
}

#[test]
fn summary_counts_rows_by_status() {
    let dir = tempfile::tempdir().unwrap();
    let path = snapshot_path(dir.path());
    assert!(read_snapshot(&path).unwrap().is_none());

    let mut pending = record(2);
    pending.payment_status = PaymentStatus::ReleaseInitiated;
    let mut flagged = record(3);
    flagged.payment_status = PaymentStatus::DepositInitiated;
    flagged.divergence = Some("deposit never landed".to_string());
    let store = MemoryStatusStore::from_records(vec![record(1), pending, flagged]);
    save_mirror(&path, &store).unwrap();

    let rows = read_snapshot(&path).unwrap().unwrap();
    let summary = SnapshotSummary::of(&rows);
    assert_eq!(summary.in_flight, 2);
    assert_eq!(summary.divergent, 1);
    assert_eq!(summary.by_status.get("none"), Some(&1));
    assert_eq!(summary.by_status.get("release_initiated"), Some(&1));
    assert_eq!(summary.by_status.get("deposited"), None);
}

#[test]
fn corrupt_snapshot_is_reported_as_invalid_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = snapshot_path(dir.path());
    std::fs::write(&path, "[{\"job_id\": }").unwrap();

    let err = read_snapshot(&path).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}
