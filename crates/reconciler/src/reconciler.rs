use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use escrow_core::enums::{PaymentStatus, Stage};
use escrow_core::ids::{JobId, TxHash};
use escrow_core::job::{LedgerJob, LedgerState, MirrorRecord};
use orchestrator::{OrchestratorError, TransactionOrchestrator};
use serde::Serialize;
use tokio::time::interval;

use crate::store::{StatusStore, StoreError};
use crate::unix_now;

/// Compare-and-set attempts before a write gives up on a contended row.
const CAS_ATTEMPTS: usize = 4;

/// Statuses whose ledger counterpart is checked on every tick.
const SCANNED: [PaymentStatus; 5] = [
    PaymentStatus::None,
    PaymentStatus::DepositInitiated,
    PaymentStatus::Deposited,
    PaymentStatus::ReleaseInitiated,
    PaymentStatus::RefundInitiated,
];

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Minimum age of an `_initiated` record before a missing ledger effect
    /// counts as divergence rather than a transaction still in flight.
    pub grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ledger read failed: {0}")]
    Ledger(#[from] OrchestratorError),

    #[error("no status record for job {0}")]
    UnknownJob(JobId),

    #[error("job {job_id}: refusing to move status backward from {from} to {to}")]
    BackwardTransition {
        job_id: JobId,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("job {job_id}: transition from {from} to {to} is not allowed")]
    InvalidTransition {
        job_id: JobId,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("job {0}: status changed concurrently")]
    Contended(JobId),
}

/// What a reconciliation pass concluded for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Mirror already agrees with the ledger.
    InSync { status: PaymentStatus },
    /// The ledger showed the stage's effect and the mirror advanced.
    Confirmed { status: PaymentStatus },
    /// Effect not visible yet but the record is still inside the grace window.
    Pending { status: PaymentStatus },
    /// Ledger inconsistent with the expected transition. Left for operators.
    DivergenceDetected { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub pending: usize,
    pub divergent: usize,
    pub failed: usize,
}

/// Keeps the status mirror eventually consistent with the ledger.
pub struct Reconciler {
    store: Arc<dyn StatusStore>,
    orchestrator: Arc<TransactionOrchestrator>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StatusStore>,
        orchestrator: Arc<TransactionOrchestrator>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Creates the `none` record for a job about to be deposited.
    ///
    /// A row still at `none` takes the new terms; callers must have checked
    /// that no deposit for it is on the ledger. Rows past `none` are
    /// returned untouched.
    pub async fn open(
        &self,
        job_id: JobId,
        payer: Address,
        payee: Address,
        usd_amount: U256,
    ) -> Result<MirrorRecord, ReconcileError> {
        let record = MirrorRecord::new(job_id, payer, payee, usd_amount, unix_now());
        if self.store.insert_if_absent(record.clone()).await? {
            tracing::debug!(%job_id, "status record created");
            return Ok(record);
        }

        let existing = self.load(job_id).await?;
        let same_terms = (existing.payer, existing.payee, existing.usd_amount) == (payer, payee, usd_amount);
        if existing.payment_status != PaymentStatus::None || same_terms {
            return Ok(existing);
        }
        if self.store.replace_unfunded(record.clone()).await? {
            tracing::info!(%job_id, %payer, %payee, "unfunded status record re-opened with new terms");
            return Ok(record);
        }
        self.load(job_id).await
    }

    /// Marks `stage` as broadcast with `tx_hash`. Repeating the call with
    /// the same hash changes nothing; a different hash for the same pending
    /// stage replaces the old one.
    ///
    /// If the reconciler confirmed the stage from ledger state first, the
    /// status is left alone and only an empty hash slot is filled.
    pub async fn record_attempt(
        &self,
        job_id: JobId,
        stage: Stage,
        tx_hash: TxHash,
    ) -> Result<(), ReconcileError> {
        let target = stage.initiated();

        for _ in 0..CAS_ATTEMPTS {
            let record = self.load(job_id).await?;
            let current = record.payment_status;

            if current.is_past(stage) {
                match record.tx_hash(stage) {
                    Some(existing) => {
                        if existing != tx_hash {
                            tracing::warn!(
                                %job_id,
                                %stage,
                                kept = %existing,
                                ignored = %tx_hash,
                                "stage already confirmed under another hash"
                            );
                        }
                        return Ok(());
                    }
                    None => {
                        if self
                            .store
                            .compare_and_set_status(job_id, current, current, Some((stage, tx_hash)), unix_now())
                            .await?
                        {
                            tracing::info!(%job_id, %stage, %tx_hash, status = %current, "hash backfilled on confirmed stage");
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            if current == target {
                match record.tx_hash(stage) {
                    Some(existing) if existing == tx_hash => return Ok(()),
                    Some(existing) => tracing::warn!(
                        %job_id,
                        %stage,
                        old = %existing,
                        new = %tx_hash,
                        "replacing recorded transaction hash"
                    ),
                    None => {}
                }
            }
            self.check_transition(job_id, current, target)?;

            if self
                .store
                .compare_and_set_status(job_id, current, target, Some((stage, tx_hash)), unix_now())
                .await?
            {
                tracing::info!(%job_id, %stage, %tx_hash, from = %current, "attempt recorded");
                return Ok(());
            }
        }

        Err(ReconcileError::Contended(job_id))
    }

    /// Moves `stage`'s `_initiated` status to its confirmed status. Returns
    /// false when the record was already confirmed for that stage.
    pub async fn confirm_stage(&self, job_id: JobId, stage: Stage) -> Result<bool, ReconcileError> {
        let target = stage.confirmed();

        for _ in 0..CAS_ATTEMPTS {
            let record = self.load(job_id).await?;
            let current = record.payment_status;

            if current == target {
                tracing::debug!(%job_id, %stage, "stage already confirmed");
                return Ok(false);
            }
            self.check_transition(job_id, current, target)?;

            if self
                .store
                .compare_and_set_status(job_id, current, target, None, unix_now())
                .await?
            {
                tracing::info!(%job_id, %stage, status = %target, "stage confirmed");
                return Ok(true);
            }
        }

        Err(ReconcileError::Contended(job_id))
    }

    /// Re-reads the ledger for one job and brings its record in line.
    ///
    /// A job with no record but a live ledger entry is adopted as `deposited`;
    /// this heals a deposit whose mirror write was lost.
    pub async fn reconcile_job(&self, job_id: JobId) -> Result<ReconcileOutcome, ReconcileError> {
        let ledger = self.orchestrator.get_details(job_id).await?;

        let Some(record) = self.store.get(job_id).await? else {
            return self.adopt(job_id, &ledger).await;
        };
        self.reconcile_record(&record, &ledger).await
    }

    /// One healing pass over every record awaiting a ledger effect.
    /// Records already flagged as divergent are skipped.
    pub async fn tick(&self) -> Result<TickReport, ReconcileError> {
        let mut report = TickReport::default();

        let mut records = Vec::new();
        for status in SCANNED {
            records.extend(self.store.list_by_status(status).await?);
        }

        for record in records {
            if record.divergence.is_some() {
                continue;
            }
            report.scanned += 1;

            let job_id = record.job_id;
            let result = match self.orchestrator.get_details(job_id).await {
                Ok(ledger) => self.reconcile_record(&record, &ledger).await,
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(ReconcileOutcome::Confirmed { .. }) => report.confirmed += 1,
                Ok(ReconcileOutcome::Pending { .. }) => report.pending += 1,
                Ok(ReconcileOutcome::DivergenceDetected { .. }) => report.divergent += 1,
                Ok(ReconcileOutcome::InSync { .. }) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(%job_id, error = %e, "failed to reconcile job");
                }
            }
        }

        tracing::debug!(
            scanned = report.scanned,
            confirmed = report.confirmed,
            pending = report.pending,
            divergent = report.divergent,
            failed = report.failed,
            "reconcile tick finished"
        );
        Ok(report)
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.interval);

        loop {
            ticker.tick().await;

            if let Err(e) = self.tick().await {
                tracing::warn!(error = %e, "error running reconcile tick");
            }
        }
    }

    async fn reconcile_record(
        &self,
        record: &MirrorRecord,
        ledger: &LedgerJob,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let job_id = record.job_id;
        let status = record.payment_status;
        let state = ledger.state();

        if let Some(reason) = &record.divergence {
            return Ok(ReconcileOutcome::DivergenceDetected {
                reason: reason.clone(),
            });
        }

        match (status, state) {
            (
                PaymentStatus::None | PaymentStatus::DepositInitiated,
                LedgerState::Posted | LedgerState::Completed,
            ) => {
                if ledger.payer != record.payer || ledger.usd_amount != record.usd_amount {
                    let reason = format!(
                        "ledger job belongs to {} for {} usd units, mirror expects {} for {}",
                        ledger.payer, ledger.usd_amount, record.payer, record.usd_amount
                    );
                    return self.diverge(job_id, reason).await;
                }
                if status == PaymentStatus::None {
                    tracing::warn!(%job_id, "deposit observed on ledger without a recorded attempt");
                    self.mark_initiated(job_id, status, Stage::Deposit).await?;
                }
                self.confirm_stage(job_id, Stage::Deposit).await?;
                if state == LedgerState::Completed {
                    // Release landed too; the next pass picks it up from `deposited`.
                    tracing::warn!(%job_id, "ledger already completed while deposit pending");
                }
                Ok(ReconcileOutcome::Confirmed {
                    status: PaymentStatus::Deposited,
                })
            }
            (PaymentStatus::DepositInitiated, LedgerState::Absent) => {
                self.unless_in_grace(record, "deposit transaction never landed: ledger shows no job")
                    .await
            }

            (PaymentStatus::Deposited, LedgerState::Posted) => Ok(ReconcileOutcome::InSync { status }),
            (PaymentStatus::Deposited, LedgerState::Completed) if ledger.is_paid => {
                tracing::warn!(%job_id, "release observed on ledger without a recorded attempt");
                self.advance_unrecorded(job_id, Stage::Release).await
            }
            (PaymentStatus::Deposited, LedgerState::Absent) => {
                tracing::warn!(%job_id, "refund observed on ledger without a recorded attempt");
                self.advance_unrecorded(job_id, Stage::Refund).await
            }

            (PaymentStatus::ReleaseInitiated, LedgerState::Completed) if ledger.is_paid => {
                self.confirm_stage(job_id, Stage::Release).await?;
                Ok(ReconcileOutcome::Confirmed {
                    status: PaymentStatus::Released,
                })
            }
            (PaymentStatus::ReleaseInitiated, LedgerState::Posted) => {
                self.unless_in_grace(record, "release transaction never landed: job not completed")
                    .await
            }
            (PaymentStatus::ReleaseInitiated, LedgerState::Absent) => {
                self.diverge(job_id, "job deleted on ledger while release pending".to_string())
                    .await
            }

            (PaymentStatus::RefundInitiated, LedgerState::Absent) => {
                self.confirm_stage(job_id, Stage::Refund).await?;
                Ok(ReconcileOutcome::Confirmed {
                    status: PaymentStatus::Refunded,
                })
            }
            (PaymentStatus::RefundInitiated, LedgerState::Posted) => {
                self.unless_in_grace(record, "refund transaction never landed: job still posted")
                    .await
            }
            (PaymentStatus::RefundInitiated, LedgerState::Completed) => {
                self.diverge(job_id, "job completed on ledger while refund pending".to_string())
                    .await
            }

            (PaymentStatus::Released, LedgerState::Completed) | (PaymentStatus::Refunded, LedgerState::Absent) => {
                Ok(ReconcileOutcome::InSync { status })
            }
            (PaymentStatus::None, LedgerState::Absent) => Ok(ReconcileOutcome::InSync { status }),

            (status, state) => {
                self.diverge(job_id, format!("mirror shows {status} but ledger shows {state:?}"))
                    .await
            }
        }
    }

    /// Creates a `deposited` record from a live ledger entry.
    async fn adopt(&self, job_id: JobId, ledger: &LedgerJob) -> Result<ReconcileOutcome, ReconcileError> {
        if ledger.is_absent() {
            return Err(ReconcileError::UnknownJob(job_id));
        }

        let mut record = MirrorRecord::new(job_id, ledger.payer, ledger.payee, ledger.usd_amount, unix_now());
        record.payment_status = PaymentStatus::Deposited;
        if !self.store.insert_if_absent(record).await? {
            // Raced with a handler creating the row; reconcile what it wrote.
            let record = self.load(job_id).await?;
            return self.reconcile_record(&record, ledger).await;
        }

        tracing::warn!(%job_id, payer = %ledger.payer, "adopted ledger job without a status record");
        if ledger.is_completed {
            return self.advance_unrecorded(job_id, Stage::Release).await;
        }
        Ok(ReconcileOutcome::Confirmed {
            status: PaymentStatus::Deposited,
        })
    }

    /// Walks `deposited` through a stage whose broadcast was never mirrored.
    /// The stage hash stays empty.
    async fn advance_unrecorded(&self, job_id: JobId, stage: Stage) -> Result<ReconcileOutcome, ReconcileError> {
        self.mark_initiated(job_id, PaymentStatus::Deposited, stage).await?;
        self.confirm_stage(job_id, stage).await?;
        Ok(ReconcileOutcome::Confirmed {
            status: stage.confirmed(),
        })
    }

    async fn mark_initiated(&self, job_id: JobId, from: PaymentStatus, stage: Stage) -> Result<(), ReconcileError> {
        let to = stage.initiated();
        self.check_transition(job_id, from, to)?;
        if !self
            .store
            .compare_and_set_status(job_id, from, to, None, unix_now())
            .await?
        {
            return Err(ReconcileError::Contended(job_id));
        }
        Ok(())
    }

    async fn unless_in_grace(
        &self,
        record: &MirrorRecord,
        reason: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let age = unix_now().saturating_sub(record.updated_at);
        if age < self.config.grace.as_secs() {
            tracing::debug!(job_id = %record.job_id, age, "ledger effect not visible yet");
            return Ok(ReconcileOutcome::Pending {
                status: record.payment_status,
            });
        }
        self.diverge(record.job_id, reason.to_string()).await
    }

    /// Flags `job_id` for operators. Later ticks skip it.
    pub async fn flag_divergence(&self, job_id: JobId, reason: String) -> Result<ReconcileOutcome, ReconcileError> {
        self.diverge(job_id, reason).await
    }

    async fn diverge(&self, job_id: JobId, reason: String) -> Result<ReconcileOutcome, ReconcileError> {
        tracing::error!(%job_id, %reason, "divergence detected between mirror and ledger");
        self.store.flag_divergence(job_id, &reason, unix_now()).await?;
        Ok(ReconcileOutcome::DivergenceDetected { reason })
    }

    fn check_transition(
        &self,
        job_id: JobId,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> Result<(), ReconcileError> {
        if from.can_transition_to(to) {
            return Ok(());
        }
        if from.rank() > to.rank() {
            tracing::warn!(%job_id, %from, %to, "refusing backward status transition");
            return Err(ReconcileError::BackwardTransition { job_id, from, to });
        }
        tracing::warn!(%job_id, %from, %to, "refusing status transition outside the table");
        Err(ReconcileError::InvalidTransition { job_id, from, to })
    }

    async fn load(&self, job_id: JobId) -> Result<MirrorRecord, ReconcileError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(ReconcileError::UnknownJob(job_id))
    }
}
