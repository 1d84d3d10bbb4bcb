//! Chain access for the escrow: the [`EscrowChain`] seam plus its two
//! backends, the deployed contract over JSON-RPC and an in-process dev chain.

pub mod contract;
pub mod local;

use std::fmt;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use escrow_core::enums::Stage;
use escrow_core::error::LedgerError;
use escrow_core::ids::{JobId, TxHash};
use escrow_core::job::LedgerJob;
use escrow_core::pricing::PriceRound;
use serde::{Deserialize, Serialize};

pub use contract::ContractClient;
pub use local::LocalChain;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("rejected by ledger: {0}")]
    Rejected(LedgerError),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("contract call failed: {0}")]
    CallFailed(String),

    #[error("no signing key for {0}")]
    UnknownSigner(Address),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl ChainError {
    /// Wraps a node error, surfacing a decodable revert as [`ChainError::Rejected`].
    pub fn from_send_error(message: String) -> Self {
        match LedgerError::from_revert(&message) {
            Some(err) => ChainError::Rejected(err),
            None => ChainError::TransactionFailed(message),
        }
    }
}

/// Ledger-mutating operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Post,
    Complete,
    Cancel,
}

impl Operation {
    pub fn stage(self) -> Stage {
        match self {
            Operation::Post => Stage::Deposit,
            Operation::Complete => Stage::Release,
            Operation::Cancel => Stage::Refund,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Post => "post",
            Operation::Complete => "complete",
            Operation::Cancel => "cancel",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostJob {
    pub job_id: JobId,
    pub payee: Address,
    pub usd_amount: U256,
    pub payer: Address,
    /// Wei attached to the transaction.
    pub value: U256,
}

/// A broadcast transaction awaiting confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTx {
    pub operation: Operation,
    pub job_id: JobId,
    pub tx_hash: TxHash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
    /// Decoded revert reason for a failed receipt, when known.
    pub revert: Option<LedgerError>,
}

#[async_trait]
pub trait EscrowChain: Send + Sync {
    /// Signs and broadcasts `postJob` from `req.payer`.
    async fn send_post(&self, req: &PostJob) -> Result<PendingTx, ChainError>;

    async fn send_complete(&self, job_id: JobId, caller: Address) -> Result<PendingTx, ChainError>;

    async fn send_cancel(&self, job_id: JobId, caller: Address) -> Result<PendingTx, ChainError>;

    /// Resolves once the transaction is mined. Never resolves for a
    /// transaction that is not included; callers bound it with a deadline.
    async fn wait_for_receipt(&self, pending: &PendingTx) -> Result<TxReceipt, ChainError>;

    async fn job_details(&self, job_id: JobId) -> Result<LedgerJob, ChainError>;

    async fn latest_price(&self) -> Result<PriceRound, ChainError>;
}
