//! Drives escrow intents onto the ledger.
//!
//! Every write is validated, signed, broadcast and then awaited until a
//! receipt arrives or the caller's deadline passes. Reads are retried; writes
//! never are, since a write whose outcome is unknown must be reconciled
//! against ledger state rather than resubmitted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use contract_client::{ChainError, EscrowChain, Operation, PendingTx, PostJob, TxReceipt};
use escrow_core::error::LedgerError;
use escrow_core::ids::{JobId, TxHash};
use escrow_core::job::LedgerJob;
use escrow_core::pricing::{usd_to_native, with_buffer, PriceRound};
use serde::Serialize;
use tokio::time::{sleep, timeout, timeout_at, Instant};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    /// Attempts per read before giving up, all within `read_timeout`.
    pub read_attempts: u32,
    pub read_backoff: Duration,
    /// Extra wei sent on post, in basis points of the quoted amount.
    pub funding_buffer_bps: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            read_attempts: 3,
            read_backoff: Duration::from_millis(250),
            funding_buffer_bps: 100,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rejected by ledger: {0}")]
    Rejected(LedgerError),

    #[error("{operation} for job {job_id} timed out after {after:?}; outcome unknown")]
    Timeout {
        operation: Operation,
        job_id: JobId,
        tx_hash: Option<TxHash>,
        after: Duration,
    },

    #[error("{query} timed out after {after:?}")]
    ReadTimeout { query: &'static str, after: Duration },

    #[error("confirmation of {tx_hash} failed: {reason}")]
    Confirmation { tx_hash: TxHash, reason: String },

    #[error("price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("chain error: {0}")]
    Chain(String),
}

impl OrchestratorError {
    /// Hash of a transaction that reached the network before the error.
    pub fn broadcast_hash(&self) -> Option<TxHash> {
        match self {
            OrchestratorError::Timeout { tx_hash, .. } => *tx_hash,
            OrchestratorError::Confirmation { tx_hash, .. } => Some(*tx_hash),
            _ => None,
        }
    }

    /// Whether the caller may retry. Ledger rejections and bad input are final.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            OrchestratorError::Validation(_) | OrchestratorError::Rejected(_)
        )
    }
}

/// Result of a confirmed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutcome {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub revert: Option<LedgerError>,
}

impl From<TxReceipt> for TxOutcome {
    fn from(receipt: TxReceipt) -> Self {
        let error = match (&receipt.revert, receipt.success) {
            (Some(reason), _) => Some(reason.to_string()),
            (None, false) => Some("transaction reverted".to_string()),
            (None, true) => None,
        };
        Self {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            success: receipt.success,
            error,
            revert: receipt.revert,
        }
    }
}

/// A write that reached the network and still awaits its receipt.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub pending: PendingTx,
    window: Window,
}

impl Broadcast {
    pub fn tx_hash(&self) -> TxHash {
        self.pending.tx_hash
    }
}

/// Deadline of one write, fixed when the write starts.
#[derive(Debug, Clone, Copy)]
struct Window {
    operation: Operation,
    job_id: JobId,
    deadline: Duration,
    deadline_at: Instant,
}

impl Window {
    fn new(operation: Operation, job_id: JobId, deadline: Duration) -> Self {
        Self {
            operation,
            job_id,
            deadline,
            deadline_at: Instant::now() + deadline,
        }
    }

    fn expired(&self, tx_hash: Option<TxHash>) -> OrchestratorError {
        OrchestratorError::Timeout {
            operation: self.operation,
            job_id: self.job_id,
            tx_hash,
            after: self.deadline,
        }
    }

    /// Caps a pre-broadcast read at the write deadline.
    async fn bound<T>(
        &self,
        read: impl Future<Output = Result<T, OrchestratorError>>,
    ) -> Result<T, OrchestratorError> {
        match timeout_at(self.deadline_at, read).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    operation = %self.operation,
                    "pre-broadcast reads used up the deadline"
                );
                Err(self.expired(None))
            }
        }
    }
}

pub struct TransactionOrchestrator {
    chain: Arc<dyn EscrowChain>,
    config: OrchestratorConfig,
}

impl TransactionOrchestrator {
    pub fn new(chain: Arc<dyn EscrowChain>, config: OrchestratorConfig) -> Self {
        Self { chain, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Escrows `usd_amount` for `job_id`, funded by `payer`.
    pub async fn post(
        &self,
        job_id: JobId,
        payee: Address,
        usd_amount: U256,
        payer: Address,
        deadline: Duration,
    ) -> Result<TxOutcome, OrchestratorError> {
        let broadcast = self
            .broadcast_post(job_id, payee, usd_amount, payer, deadline)
            .await?;
        self.await_receipt(broadcast).await
    }

    /// Releases the escrow to the payee. `caller` must be the payer.
    pub async fn complete(
        &self,
        job_id: JobId,
        caller: Address,
        deadline: Duration,
    ) -> Result<TxOutcome, OrchestratorError> {
        let broadcast = self.broadcast_complete(job_id, caller, deadline).await?;
        self.await_receipt(broadcast).await
    }

    /// Refunds the escrow to the payer. `caller` must be the payer.
    pub async fn cancel(
        &self,
        job_id: JobId,
        caller: Address,
        deadline: Duration,
    ) -> Result<TxOutcome, OrchestratorError> {
        let broadcast = self.broadcast_cancel(job_id, caller, deadline).await?;
        self.await_receipt(broadcast).await
    }

    /// Input checks for a post, run before anything touches the network.
    pub fn validate_post(
        &self,
        payee: Address,
        usd_amount: U256,
        payer: Address,
    ) -> Result<(), OrchestratorError> {
        require_address("payee", payee)?;
        require_address("payer", payer)?;
        if usd_amount.is_zero() {
            return Err(OrchestratorError::Validation(
                "usd amount must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// First half of [`post`](Self::post): validates, checks for a duplicate,
    /// quotes and broadcasts. The pre-reads share the write deadline.
    pub async fn broadcast_post(
        &self,
        job_id: JobId,
        payee: Address,
        usd_amount: U256,
        payer: Address,
        deadline: Duration,
    ) -> Result<Broadcast, OrchestratorError> {
        let window = Window::new(Operation::Post, job_id, deadline);
        self.validate_post(payee, usd_amount, payer)?;

        let existing = window.bound(self.get_details(job_id)).await?;
        if !existing.is_absent() {
            tracing::info!(%job_id, "post refused: job already on ledger");
            return Err(OrchestratorError::Rejected(LedgerError::JobAlreadyExists));
        }

        let native = window.bound(self.quote(usd_amount)).await?;
        let value = with_buffer(native, self.config.funding_buffer_bps);
        tracing::debug!(%job_id, %native, %value, "funding post");

        let req = PostJob {
            job_id,
            payee,
            usd_amount,
            payer,
            value,
        };
        self.broadcast(window, || self.chain.send_post(&req)).await
    }

    pub async fn broadcast_complete(
        &self,
        job_id: JobId,
        caller: Address,
        deadline: Duration,
    ) -> Result<Broadcast, OrchestratorError> {
        require_address("caller", caller)?;
        let window = Window::new(Operation::Complete, job_id, deadline);
        self.broadcast(window, || self.chain.send_complete(job_id, caller))
            .await
    }

    pub async fn broadcast_cancel(
        &self,
        job_id: JobId,
        caller: Address,
        deadline: Duration,
    ) -> Result<Broadcast, OrchestratorError> {
        require_address("caller", caller)?;
        let window = Window::new(Operation::Cancel, job_id, deadline);
        self.broadcast(window, || self.chain.send_cancel(job_id, caller))
            .await
    }

    /// Ledger view of a job; absent ids come back as the zero record.
    pub async fn get_details(&self, job_id: JobId) -> Result<LedgerJob, OrchestratorError> {
        self.read("get_details", || self.chain.job_details(job_id))
            .await
    }

    pub async fn latest_price(&self) -> Result<PriceRound, OrchestratorError> {
        self.read("latest_price", || self.chain.latest_price())
            .await
            .map_err(|e| match e {
                OrchestratorError::Chain(reason) => OrchestratorError::PriceUnavailable(reason),
                other => other,
            })
    }

    /// Wei required for `usd_amount` at the current feed price.
    pub async fn quote(&self, usd_amount: U256) -> Result<U256, OrchestratorError> {
        let round = self.latest_price().await?;
        usd_to_native(usd_amount, &round).map_err(|e| match e {
            LedgerError::PriceUnavailable(reason) => OrchestratorError::PriceUnavailable(reason),
            other => OrchestratorError::Rejected(other),
        })
    }

    async fn broadcast<F, Fut>(&self, window: Window, send: F) -> Result<Broadcast, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PendingTx, ChainError>> + Send,
    {
        let Window {
            operation, job_id, ..
        } = window;

        let pending = match timeout_at(window.deadline_at, send()).await {
            Err(_) => {
                tracing::warn!(%job_id, %operation, "broadcast did not return before deadline");
                return Err(window.expired(None));
            }
            Ok(Err(ChainError::Rejected(reason))) => {
                tracing::info!(%job_id, %operation, %reason, "rejected by ledger");
                return Err(OrchestratorError::Rejected(reason));
            }
            Ok(Err(e)) => {
                tracing::warn!(%job_id, %operation, error = %e, "broadcast failed");
                return Err(OrchestratorError::Chain(e.to_string()));
            }
            Ok(Ok(pending)) => pending,
        };

        tracing::info!(
            %job_id,
            %operation,
            tx_hash = %pending.tx_hash,
            "transaction broadcast, awaiting confirmation"
        );
        Ok(Broadcast { pending, window })
    }

    /// Second half of a write: waits for the receipt of `broadcast` until
    /// the deadline it was started with.
    pub async fn await_receipt(&self, broadcast: Broadcast) -> Result<TxOutcome, OrchestratorError> {
        let Broadcast { pending, window } = broadcast;
        let Window {
            operation, job_id, ..
        } = window;

        match timeout_at(window.deadline_at, self.chain.wait_for_receipt(&pending)).await {
            Err(_) => {
                tracing::warn!(
                    %job_id,
                    %operation,
                    tx_hash = %pending.tx_hash,
                    "confirmation not observed before deadline; outcome unknown"
                );
                Err(window.expired(Some(pending.tx_hash)))
            }
            Ok(Err(e)) => Err(OrchestratorError::Confirmation {
                tx_hash: pending.tx_hash,
                reason: e.to_string(),
            }),
            Ok(Ok(receipt)) => {
                let outcome = TxOutcome::from(receipt);
                tracing::info!(
                    %job_id,
                    %operation,
                    tx_hash = %outcome.tx_hash,
                    block = outcome.block_number,
                    gas_used = outcome.gas_used,
                    success = outcome.success,
                    "transaction confirmed"
                );
                Ok(outcome)
            }
        }
    }

    async fn read<T, F, Fut>(&self, query: &'static str, call: F) -> Result<T, OrchestratorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ChainError>> + Send,
    {
        let attempts = self.config.read_attempts.max(1);
        let backoff = self.config.read_backoff;

        let retried = async {
            let mut attempt = 1;
            loop {
                match call().await {
                    Ok(value) => return Ok(value),
                    Err(e) if attempt < attempts => {
                        tracing::debug!(query, attempt, error = %e, "read failed, retrying");
                        sleep(backoff * attempt).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match timeout(self.config.read_timeout, retried).await {
            Err(_) => Err(OrchestratorError::ReadTimeout {
                query,
                after: self.config.read_timeout,
            }),
            Ok(Err(e)) => Err(OrchestratorError::Chain(e.to_string())),
            Ok(Ok(value)) => Ok(value),
        }
    }
}

fn require_address(field: &str, address: Address) -> Result<(), OrchestratorError> {
    if address == Address::ZERO {
        return Err(OrchestratorError::Validation(format!("{field} address is zero")));
    }
    Ok(())
}
