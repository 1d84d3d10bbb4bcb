use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use escrow_core::enums::{PaymentStatus, Stage};
use escrow_core::error::LedgerError;
use escrow_core::ids::{JobId, TxHash};
use escrow_core::job::{LedgerJob, MirrorRecord};
use escrow_core::pricing::PriceRound;
use orchestrator::{Broadcast, OrchestratorError, TransactionOrchestrator, TxOutcome};
use reconciler::{ReconcileError, ReconcileOutcome, Reconciler, StatusStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no payment record for job {0}")]
    NotFound(JobId),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

pub struct PostJob {
    pub job_id: JobId,
    pub payee: Address,
    pub usd_amount: U256,
    pub payer: Address,
}

/// Drives escrow writes through the orchestrator and keeps the mirror in step.
///
/// Each attempt is mirrored as soon as it is broadcast. The chain result is
/// what callers get back; mirror writes that fail are logged and left for
/// the reconciler.
pub struct EscrowService {
    orchestrator: Arc<TransactionOrchestrator>,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn StatusStore>,
    write_timeout: Duration,
}

impl EscrowService {
    pub fn new(
        orchestrator: Arc<TransactionOrchestrator>,
        reconciler: Arc<Reconciler>,
        write_timeout: Duration,
    ) -> Self {
        let store = reconciler.store().clone();
        Self {
            orchestrator,
            reconciler,
            store,
            write_timeout,
        }
    }

    pub async fn post_job(&self, req: PostJob) -> Result<TxOutcome, ServiceError> {
        let job_id = req.job_id;
        self.orchestrator
            .validate_post(req.payee, req.usd_amount, req.payer)?;

        if let Some(record) = self.store.get(job_id).await? {
            if record.payment_status != PaymentStatus::None {
                return Err(ServiceError::Conflict(format!(
                    "job {job_id} already has payment status '{}'",
                    record.payment_status
                )));
            }
            let same_terms =
                (record.payer, record.payee, record.usd_amount) == (req.payer, req.payee, req.usd_amount);
            if !same_terms && !self.orchestrator.get_details(job_id).await?.is_absent() {
                // A deposit under the old terms landed without being mirrored.
                return Err(OrchestratorError::Rejected(LedgerError::JobAlreadyExists).into());
            }
        }
        self.reconciler
            .open(job_id, req.payer, req.payee, req.usd_amount)
            .await?;

        let broadcast = self
            .orchestrator
            .broadcast_post(job_id, req.payee, req.usd_amount, req.payer, self.write_timeout)
            .await?;
        self.settle(job_id, Stage::Deposit, broadcast).await
    }

    pub async fn complete_job(&self, job_id: JobId) -> Result<TxOutcome, ServiceError> {
        let record = self.deposited_record(job_id, "complete").await?;
        let broadcast = self
            .orchestrator
            .broadcast_complete(job_id, record.payer, self.write_timeout)
            .await?;
        self.settle(job_id, Stage::Release, broadcast).await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<TxOutcome, ServiceError> {
        let record = self.deposited_record(job_id, "cancel").await?;
        let broadcast = self
            .orchestrator
            .broadcast_cancel(job_id, record.payer, self.write_timeout)
            .await?;
        self.settle(job_id, Stage::Refund, broadcast).await
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<MirrorRecord, ServiceError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(ServiceError::NotFound(job_id))
    }

    /// Checks `stage` against the ledger and returns the resulting record.
    pub async fn confirm(
        &self,
        job_id: JobId,
        stage: Stage,
    ) -> Result<(MirrorRecord, ReconcileOutcome), ServiceError> {
        let outcome = self.reconciler.reconcile_job(job_id).await.map_err(|e| match e {
            ReconcileError::UnknownJob(id) => ServiceError::NotFound(id),
            other => other.into(),
        })?;
        let record = self.job_status(job_id).await?;
        tracing::debug!(%job_id, %stage, status = %record.payment_status, "confirmation checked");
        Ok((record, outcome))
    }

    pub async fn job_details(&self, job_id: JobId) -> Result<LedgerJob, ServiceError> {
        Ok(self.orchestrator.get_details(job_id).await?)
    }

    pub async fn eth_price(&self) -> Result<PriceRound, ServiceError> {
        Ok(self.orchestrator.latest_price().await?)
    }

    /// Loads the record and requires `deposited`, reconciling a pending
    /// deposit first.
    async fn deposited_record(&self, job_id: JobId, action: &str) -> Result<MirrorRecord, ServiceError> {
        let mut record = self.job_status(job_id).await?;

        if record.payment_status == PaymentStatus::DepositInitiated {
            tracing::debug!(%job_id, "deposit still pending in mirror, checking ledger");
            self.reconciler.reconcile_job(job_id).await?;
            record = self.job_status(job_id).await?;
        }

        if record.payment_status != PaymentStatus::Deposited {
            return Err(ServiceError::Conflict(format!(
                "cannot {action} job: payment status is '{}', expected 'deposited'",
                record.payment_status
            )));
        }
        Ok(record)
    }

    /// Mirrors the attempt as soon as it is broadcast, then waits for the
    /// receipt and confirms the stage.
    async fn settle(&self, job_id: JobId, stage: Stage, broadcast: Broadcast) -> Result<TxOutcome, ServiceError> {
        let tx_hash = broadcast.tx_hash();
        let recorded = self.record_attempt(job_id, stage, tx_hash).await;

        let result = self.orchestrator.await_receipt(broadcast).await;
        match &result {
            Ok(outcome) if outcome.success => {
                if recorded || self.record_attempt(job_id, stage, tx_hash).await {
                    if let Err(e) = self.reconciler.confirm_stage(job_id, stage).await {
                        tracing::error!(%job_id, %stage, %tx_hash, error = %e, "failed to confirm stage in mirror");
                    }
                }
            }
            Ok(outcome) => {
                let reason = format!(
                    "{stage} transaction {tx_hash} reverted: {}",
                    outcome.error.as_deref().unwrap_or("no reason given")
                );
                if let Err(e) = self.reconciler.flag_divergence(job_id, reason).await {
                    tracing::error!(%job_id, %stage, %tx_hash, error = %e, "failed to flag reverted transaction");
                }
            }
            Err(_) if !recorded => {
                self.record_attempt(job_id, stage, tx_hash).await;
            }
            Err(_) => {}
        }
        Ok(result?)
    }

    /// Failures are logged and left for the reconciler to heal.
    async fn record_attempt(&self, job_id: JobId, stage: Stage, tx_hash: TxHash) -> bool {
        match self.reconciler.record_attempt(job_id, stage, tx_hash).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%job_id, %stage, %tx_hash, error = %e, "failed to record attempt in mirror");
                false
            }
        }
    }
}
