use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use escrow_core::error::LedgerError;
use escrow_core::ids::{JobId, TxHash};
use escrow_core::job::LedgerJob;
use escrow_core::pricing::PriceRound;
use escrow_ledger::JobLedger;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use crate::{ChainError, EscrowChain, Operation, PendingTx, PostJob, TxReceipt};

const GAS_POST: u64 = 142_318;
const GAS_COMPLETE: u64 = 71_904;
const GAS_CANCEL: u64 = 38_511;

struct MinedTx {
    receipt: TxReceipt,
    visible_at: Instant,
}

/// In-process chain backed by a [`JobLedger`].
///
/// Transactions execute against the ledger at broadcast time, in the order
/// the ledger lock is acquired, while their receipts only become visible
/// after the configured confirmation delay. A timed-out wait therefore
/// never undoes the ledger effect, exactly as on a real network.
#[derive(Clone)]
pub struct LocalChain {
    ledger: Arc<Mutex<JobLedger>>,
    mined: Arc<DashMap<TxHash, MinedTx>>,
    block_number: Arc<AtomicU64>,
    nonce: Arc<AtomicU64>,
    confirmation_delay_ms: Arc<AtomicU64>,
    drop_next: Arc<AtomicBool>,
}

impl LocalChain {
    pub fn new(ledger: JobLedger) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(ledger)),
            mined: Arc::new(DashMap::new()),
            block_number: Arc::new(AtomicU64::new(1)),
            nonce: Arc::new(AtomicU64::new(0)),
            confirmation_delay_ms: Arc::new(AtomicU64::new(0)),
            drop_next: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ledger(&self) -> Arc<Mutex<JobLedger>> {
        self.ledger.clone()
    }

    pub fn block_number(&self) -> u64 {
        self.block_number.load(Ordering::SeqCst)
    }

    pub fn set_confirmation_delay(&self, delay: Duration) {
        self.confirmation_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next broadcast returns a hash but is never included.
    pub fn drop_next_broadcast(&self) {
        self.drop_next.store(true, Ordering::SeqCst);
    }

    async fn execute<F>(
        &self,
        operation: Operation,
        job_id: JobId,
        gas_used: u64,
        apply: F,
    ) -> Result<PendingTx, ChainError>
    where
        F: FnOnce(&mut JobLedger) -> Result<(), LedgerError> + Send,
    {
        let tx_hash = self.next_tx_hash(operation, job_id);
        let pending = PendingTx {
            operation,
            job_id,
            tx_hash,
        };

        if self.drop_next.swap(false, Ordering::SeqCst) {
            tracing::debug!(%job_id, %tx_hash, %operation, "dropping broadcast");
            return Ok(pending);
        }

        {
            let mut ledger = self.ledger.lock().await;
            apply(&mut ledger).map_err(ChainError::Rejected)?;
        }

        let block_number = self.block_number.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = Duration::from_millis(self.confirmation_delay_ms.load(Ordering::SeqCst));
        self.mined.insert(
            tx_hash,
            MinedTx {
                receipt: TxReceipt {
                    tx_hash,
                    block_number,
                    gas_used,
                    success: true,
                    revert: None,
                },
                visible_at: Instant::now() + delay,
            },
        );

        tracing::debug!(%job_id, %tx_hash, %operation, block_number, "local transaction mined");
        Ok(pending)
    }

    fn next_tx_hash(&self, operation: Operation, job_id: JobId) -> TxHash {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(operation.to_string().as_bytes());
        hasher.update(job_id.0.to_be_bytes());
        hasher.update(nonce.to_be_bytes());
        TxHash(hasher.finalize().into())
    }
}

#[async_trait]
impl EscrowChain for LocalChain {
    async fn send_post(&self, req: &PostJob) -> Result<PendingTx, ChainError> {
        let req = req.clone();
        self.execute(Operation::Post, req.job_id, GAS_POST, move |ledger| {
            ledger
                .post(req.job_id, req.payee, req.usd_amount, req.payer, req.value)
                .map(|_| ())
        })
        .await
    }

    async fn send_complete(&self, job_id: JobId, caller: Address) -> Result<PendingTx, ChainError> {
        self.execute(Operation::Complete, job_id, GAS_COMPLETE, move |ledger| {
            ledger.complete(job_id, caller)
        })
        .await
    }

    async fn send_cancel(&self, job_id: JobId, caller: Address) -> Result<PendingTx, ChainError> {
        self.execute(Operation::Cancel, job_id, GAS_CANCEL, move |ledger| {
            ledger.cancel(job_id, caller).map(|_| ())
        })
        .await
    }

    async fn wait_for_receipt(&self, pending: &PendingTx) -> Result<TxReceipt, ChainError> {
        let visible_at = self.mined.get(&pending.tx_hash).map(|tx| tx.visible_at);
        let visible_at = match visible_at {
            Some(at) => at,
            None => std::future::pending::<Instant>().await,
        };
        sleep_until(visible_at).await;

        self.mined
            .get(&pending.tx_hash)
            .map(|tx| tx.receipt.clone())
            .ok_or_else(|| ChainError::TransactionFailed("receipt disappeared".to_string()))
    }

    async fn job_details(&self, job_id: JobId) -> Result<LedgerJob, ChainError> {
        Ok(self.ledger.lock().await.get_details(job_id))
    }

    async fn latest_price(&self) -> Result<PriceRound, ChainError> {
        self.ledger
            .lock()
            .await
            .oracle()
            .latest_round()
            .map_err(|e| ChainError::CallFailed(e.to_string()))
    }
}
