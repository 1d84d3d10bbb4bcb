use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use contract_client::LocalChain;
use escrow_core::enums::{PaymentStatus, Stage};
use escrow_core::ids::{JobId, TxHash};
use escrow_core::pricing::parse_usd;
use escrow_ledger::{JobLedger, ManualPriceFeed, PriceOracle};
use orchestrator::{OrchestratorConfig, TransactionOrchestrator};
use reconciler::{
    MemoryStatusStore, ReconcileError, ReconcileOutcome, Reconciler, ReconcilerConfig, StatusStore,
    StoreError,
};

const OWNER: Address = Address::repeat_byte(0x0a);
const PAYER: Address = Address::repeat_byte(0xa1);
const PAYEE: Address = Address::repeat_byte(0xb2);
const WRITE: Duration = Duration::from_secs(30);

struct Harness {
    store: MemoryStatusStore,
    orchestrator: Arc<TransactionOrchestrator>,
    reconciler: Arc<Reconciler>,
}

fn harness_with_grace(grace: Duration) -> Harness {
    let feed = Arc::new(ManualPriceFeed::with_usd_price(3000));
    let chain = LocalChain::new(JobLedger::new(OWNER, PriceOracle::new(feed)));
    let orchestrator = Arc::new(TransactionOrchestrator::new(
        Arc::new(chain),
        OrchestratorConfig::default(),
    ));
    let store = MemoryStatusStore::new();
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(store.clone()),
        orchestrator.clone(),
        ReconcilerConfig {
            interval: Duration::from_secs(30),
            grace,
        },
    ));
    Harness {
        store,
        orchestrator,
        reconciler,
    }
}

fn harness() -> Harness {
    harness_with_grace(Duration::ZERO)
}

fn usd() -> U256 {
    parse_usd("1000").unwrap()
}

fn hash(n: u8) -> TxHash {
    TxHash([n; 32])
}

impl Harness {
    async fn status(&self, id: JobId) -> PaymentStatus {
        self.store.get(id).await.unwrap().unwrap().payment_status
    }

    async fn open(&self, id: JobId) {
        self.reconciler.open(id, PAYER, PAYEE, usd()).await.unwrap();
    }

    /// Posts on the ledger and mirrors it through `deposited`.
    async fn deposited(&self, id: JobId) {
        let outcome = self
            .orchestrator
            .post(id, PAYEE, usd(), PAYER, WRITE)
            .await
            .unwrap();
        self.open(id).await;
        self.reconciler
            .record_attempt(id, Stage::Deposit, outcome.tx_hash)
            .await
            .unwrap();
        assert!(self.reconciler.confirm_stage(id, Stage::Deposit).await.unwrap());
    }
}

#[tokio::test]
async fn confirm_stage_twice_equals_once() {
    let h = harness();
    let id = JobId(1);
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(1))
        .await
        .unwrap();

    assert!(h.reconciler.confirm_stage(id, Stage::Deposit).await.unwrap());
    let once = h.store.get(id).await.unwrap().unwrap();

    assert!(!h.reconciler.confirm_stage(id, Stage::Deposit).await.unwrap());
    let twice = h.store.get(id).await.unwrap().unwrap();

    assert_eq!(once, twice);
    assert_eq!(twice.payment_status, PaymentStatus::Deposited);
    assert_eq!(twice.tx_hash_deposit, Some(hash(1)));
}

#[tokio::test]
async fn repeated_attempt_with_same_hash_is_a_no_op() {
    let h = harness();
    let id = JobId(2);
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(2))
        .await
        .unwrap();
    let first = h.store.get(id).await.unwrap().unwrap();

    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(2))
        .await
        .unwrap();
    assert_eq!(h.store.get(id).await.unwrap().unwrap(), first);
}

#[tokio::test]
async fn rebroadcast_replaces_pending_hash() {
    let h = harness();
    let id = JobId(3);
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(3))
        .await
        .unwrap();
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(4))
        .await
        .unwrap();

    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.payment_status, PaymentStatus::DepositInitiated);
    assert_eq!(record.tx_hash_deposit, Some(hash(4)));
}

#[tokio::test]
async fn status_never_moves_backward() {
    let h = harness();
    let id = JobId(4);
    h.deposited(id).await;
    h.reconciler
        .record_attempt(id, Stage::Release, hash(5))
        .await
        .unwrap();
    h.reconciler.confirm_stage(id, Stage::Release).await.unwrap();

    let err = h
        .reconciler
        .confirm_stage(id, Stage::Deposit)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::BackwardTransition {
            from: PaymentStatus::Released,
            to: PaymentStatus::Deposited,
            ..
        }
    ));

    let deposit_hash = h.store.get(id).await.unwrap().unwrap().tx_hash_deposit;
    // A stale deposit attempt leaves the status and the recorded hash alone.
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(6))
        .await
        .unwrap();

    let err = h
        .reconciler
        .record_attempt(id, Stage::Refund, hash(7))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::BackwardTransition { .. }));

    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.payment_status, PaymentStatus::Released);
    assert_eq!(record.tx_hash_deposit, deposit_hash);
    assert_eq!(record.tx_hash_refund, None);
}

#[tokio::test]
async fn release_and_refund_branches_exclude_each_other() {
    let h = harness();
    let id = JobId(5);
    h.deposited(id).await;
    h.reconciler
        .record_attempt(id, Stage::Release, hash(8))
        .await
        .unwrap();

    let err = h
        .reconciler
        .record_attempt(id, Stage::Refund, hash(9))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::InvalidTransition {
            from: PaymentStatus::ReleaseInitiated,
            to: PaymentStatus::RefundInitiated,
            ..
        }
    ));
    assert_eq!(h.status(id).await, PaymentStatus::ReleaseInitiated);
}

#[tokio::test]
async fn confirm_without_attempt_is_refused() {
    let h = harness();
    let id = JobId(6);
    h.open(id).await;

    let err = h
        .reconciler
        .confirm_stage(id, Stage::Deposit)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidTransition { .. }));
    assert_eq!(h.status(id).await, PaymentStatus::None);
}

#[tokio::test]
async fn attempts_need_an_open_record() {
    let h = harness();
    let err = h
        .reconciler
        .record_attempt(JobId(404), Stage::Deposit, hash(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::UnknownJob(JobId(404))));
}

#[tokio::test]
async fn open_keeps_existing_record() {
    let h = harness();
    let id = JobId(8);
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(1))
        .await
        .unwrap();

    let record = h
        .reconciler
        .open(id, Address::repeat_byte(0xee), PAYEE, U256::from(1))
        .await
        .unwrap();
    assert_eq!(record.payer, PAYER);
    assert_eq!(record.payment_status, PaymentStatus::DepositInitiated);
}

#[tokio::test]
async fn unfunded_record_takes_new_terms() {
    let h = harness();
    let id = JobId(25);
    h.open(id).await;

    let corrected = parse_usd("1200").unwrap();
    let record = h
        .reconciler
        .open(id, PAYER, Address::repeat_byte(0xee), corrected)
        .await
        .unwrap();
    assert_eq!(record.payee, Address::repeat_byte(0xee));
    assert_eq!(record.usd_amount, corrected);
    assert_eq!(h.store.get(id).await.unwrap().unwrap(), record);
}

#[tokio::test]
async fn tick_flags_deposit_that_never_landed() {
    let h = harness();
    let id = JobId(11);
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(11))
        .await
        .unwrap();

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.divergent, 1);
    assert_eq!(report.confirmed, 0);

    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.payment_status, PaymentStatus::DepositInitiated);
    assert!(record.divergence.is_some());

    // Left for operators: later ticks do not touch it.
    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.scanned, 0);
}

#[tokio::test]
async fn fresh_attempts_are_pending_inside_grace() {
    let h = harness_with_grace(Duration::from_secs(120));
    let id = JobId(12);
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(12))
        .await
        .unwrap();

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.divergent, 0);
    assert!(h.store.get(id).await.unwrap().unwrap().divergence.is_none());
}

#[tokio::test]
async fn tick_confirms_landed_deposit() {
    let h = harness();
    let id = JobId(13);
    let outcome = h
        .orchestrator
        .post(id, PAYEE, usd(), PAYER, WRITE)
        .await
        .unwrap();
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, outcome.tx_hash)
        .await
        .unwrap();

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(h.status(id).await, PaymentStatus::Deposited);
}

#[tokio::test]
async fn tick_confirms_release_and_refund() {
    let h = harness();
    let released = JobId(14);
    let refunded = JobId(15);
    h.deposited(released).await;
    h.deposited(refunded).await;

    let outcome = h.orchestrator.complete(released, PAYER, WRITE).await.unwrap();
    h.reconciler
        .record_attempt(released, Stage::Release, outcome.tx_hash)
        .await
        .unwrap();
    let outcome = h.orchestrator.cancel(refunded, PAYER, WRITE).await.unwrap();
    h.reconciler
        .record_attempt(refunded, Stage::Refund, outcome.tx_hash)
        .await
        .unwrap();

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.confirmed, 2);
    assert_eq!(h.status(released).await, PaymentStatus::Released);
    assert_eq!(h.status(refunded).await, PaymentStatus::Refunded);

    let record = h.store.get(refunded).await.unwrap().unwrap();
    assert_eq!(record.tx_hash_refund, Some(outcome.tx_hash));
}

#[tokio::test]
async fn tick_flags_refund_pending_on_completed_job() {
    let h = harness();
    let id = JobId(16);
    h.deposited(id).await;
    h.reconciler
        .record_attempt(id, Stage::Refund, hash(16))
        .await
        .unwrap();
    h.orchestrator.complete(id, PAYER, WRITE).await.unwrap();

    let outcome = h.reconciler.reconcile_job(id).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::DivergenceDetected { .. }));
    assert_eq!(h.status(id).await, PaymentStatus::RefundInitiated);
}

#[tokio::test]
async fn tick_heals_release_whose_attempt_was_lost() {
    let h = harness();
    let id = JobId(17);
    h.deposited(id).await;
    h.orchestrator.complete(id, PAYER, WRITE).await.unwrap();

    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.confirmed, 1);

    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.payment_status, PaymentStatus::Released);
    assert_eq!(record.tx_hash_release, None);
}

#[tokio::test]
async fn late_attempt_fills_hash_of_healed_stage() {
    let h = harness();
    let id = JobId(119);
    h.deposited(id).await;
    let outcome = h.orchestrator.complete(id, PAYER, WRITE).await.unwrap();
    h.reconciler.tick().await.unwrap();

    h.reconciler
        .record_attempt(id, Stage::Release, outcome.tx_hash)
        .await
        .unwrap();
    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.payment_status, PaymentStatus::Released);
    assert_eq!(record.tx_hash_release, Some(outcome.tx_hash));

    // Once filled, the slot is not overwritten.
    h.reconciler
        .record_attempt(id, Stage::Release, hash(99))
        .await
        .unwrap();
    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.tx_hash_release, Some(outcome.tx_hash));
    assert!(!h.reconciler.confirm_stage(id, Stage::Release).await.unwrap());
}

#[tokio::test]
async fn tick_heals_deposit_whose_attempt_was_lost() {
    let h = harness();
    let id = JobId(18);
    h.open(id).await;
    h.orchestrator
        .post(id, PAYEE, usd(), PAYER, WRITE)
        .await
        .unwrap();

    h.reconciler.tick().await.unwrap();
    assert_eq!(h.status(id).await, PaymentStatus::Deposited);
}

#[tokio::test]
async fn reconcile_job_adopts_unmirrored_ledger_job() {
    let h = harness();
    let id = JobId(19);
    h.orchestrator
        .post(id, PAYEE, usd(), PAYER, WRITE)
        .await
        .unwrap();

    let outcome = h.reconciler.reconcile_job(id).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Confirmed {
            status: PaymentStatus::Deposited
        }
    );
    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.payer, PAYER);
    assert_eq!(record.payee, PAYEE);
    assert_eq!(record.usd_amount, usd());
}

#[tokio::test]
async fn reconcile_job_without_record_or_ledger_entry() {
    let h = harness();
    let err = h.reconciler.reconcile_job(JobId(20)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::UnknownJob(JobId(20))));
}

#[tokio::test]
async fn foreign_ledger_job_is_divergent() {
    let h = harness();
    let id = JobId(21);
    let other = Address::repeat_byte(0xdd);
    h.orchestrator
        .post(id, PAYEE, usd(), other, WRITE)
        .await
        .unwrap();
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(21))
        .await
        .unwrap();

    let outcome = h.reconciler.reconcile_job(id).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::DivergenceDetected { .. }));
    assert_eq!(h.status(id).await, PaymentStatus::DepositInitiated);
}

#[tokio::test]
async fn concurrent_confirms_apply_once() {
    let h = harness();
    let id = JobId(22);
    h.open(id).await;
    h.reconciler
        .record_attempt(id, Stage::Deposit, hash(22))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let reconciler = h.reconciler.clone();
        handles.push(tokio::spawn(async move {
            reconciler.confirm_stage(id, Stage::Deposit).await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(h.status(id).await, PaymentStatus::Deposited);
}

#[tokio::test]
async fn store_outage_fails_the_tick() {
    let h = harness();
    h.open(JobId(23)).await;
    h.store.set_unavailable(true);

    let err = h.reconciler.tick().await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Unavailable(_))));

    h.store.set_unavailable(false);
    assert!(h.reconciler.tick().await.is_ok());
}

#[tokio::test]
async fn compare_and_set_rejects_stale_expectation() {
    let store = MemoryStatusStore::new();
    let id = JobId(24);
    let record = escrow_core::job::MirrorRecord::new(id, PAYER, PAYEE, usd(), 100);
    assert!(store.insert_if_absent(record.clone()).await.unwrap());
    assert!(!store.insert_if_absent(record).await.unwrap());

    assert!(store
        .compare_and_set_status(
            id,
            PaymentStatus::None,
            PaymentStatus::DepositInitiated,
            Some((Stage::Deposit, hash(24))),
            200,
        )
        .await
        .unwrap());
    assert!(!store
        .compare_and_set_status(
            id,
            PaymentStatus::None,
            PaymentStatus::DepositInitiated,
            Some((Stage::Deposit, hash(25))),
            300,
        )
        .await
        .unwrap());

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.tx_hash_deposit, Some(hash(24)));
    assert_eq!(row.updated_at, 200);
    assert!(!store
        .compare_and_set_status(
            JobId(999),
            PaymentStatus::None,
            PaymentStatus::DepositInitiated,
            None,
            300,
        )
        .await
        .unwrap());
}

#[tokio::test]
async fn replace_unfunded_only_touches_none_rows() {
    let store = MemoryStatusStore::new();
    let id = JobId(26);
    let original = escrow_core::job::MirrorRecord::new(id, PAYER, PAYEE, usd(), 100);
    let mut changed = original.clone();
    changed.usd_amount = U256::from(5);

    assert!(!store.replace_unfunded(changed.clone()).await.unwrap(), "missing row");
    store.insert_if_absent(original).await.unwrap();
    assert!(store.replace_unfunded(changed.clone()).await.unwrap());

    store
        .compare_and_set_status(
            id,
            PaymentStatus::None,
            PaymentStatus::DepositInitiated,
            Some((Stage::Deposit, hash(26))),
            200,
        )
        .await
        .unwrap();
    let mut again = changed.clone();
    again.usd_amount = U256::from(9);
    assert!(!store.replace_unfunded(again).await.unwrap());
    assert_eq!(store.get(id).await.unwrap().unwrap().usd_amount, U256::from(5));
}
