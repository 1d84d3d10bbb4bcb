use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::{
    enums::{PaymentStatus, Stage},
    ids::{JobId, TxHash},
};

/// Ledger record for one escrowed job. An all-zero record means the id is
/// absent (never posted or deleted by cancellation).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerJob {
    pub payer: Address,
    pub payee: Address,
    pub usd_amount: U256,
    pub native_amount: U256,
    pub is_completed: bool,
    pub is_paid: bool,
}

/// Coarse ledger state of a job id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Absent,
    Posted,
    Completed,
}

impl LedgerJob {
    pub fn is_absent(&self) -> bool {
        self.payer == Address::ZERO
    }

    pub fn state(&self) -> LedgerState {
        if self.is_absent() {
            LedgerState::Absent
        } else if self.is_completed {
            LedgerState::Completed
        } else {
            LedgerState::Posted
        }
    }
}

/// Off-chain status mirror row. Never deleted, even after the ledger record
/// is removed by a refund.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub job_id: JobId,
    pub payment_status: PaymentStatus,
    pub payer: Address,
    pub payee: Address,
    pub usd_amount: U256,
    pub tx_hash_deposit: Option<TxHash>,
    pub tx_hash_release: Option<TxHash>,
    pub tx_hash_refund: Option<TxHash>,
    /// Unix seconds of the last mutation.
    pub updated_at: u64,
    /// Set when the reconciler finds the ledger inconsistent with the record.
    pub divergence: Option<String>,
}

impl MirrorRecord {
    pub fn new(job_id: JobId, payer: Address, payee: Address, usd_amount: U256, now: u64) -> Self {
        Self {
            job_id,
            payment_status: PaymentStatus::None,
            payer,
            payee,
            usd_amount,
            tx_hash_deposit: None,
            tx_hash_release: None,
            tx_hash_refund: None,
            updated_at: now,
            divergence: None,
        }
    }

    pub fn tx_hash(&self, stage: Stage) -> Option<TxHash> {
        match stage {
            Stage::Deposit => self.tx_hash_deposit,
            Stage::Release => self.tx_hash_release,
            Stage::Refund => self.tx_hash_refund,
        }
    }

    pub fn set_tx_hash(&mut self, stage: Stage, hash: TxHash) {
        let slot = match stage {
            Stage::Deposit => &mut self.tx_hash_deposit,
            Stage::Release => &mut self.tx_hash_release,
            Stage::Refund => &mut self.tx_hash_refund,
        };
        *slot = Some(hash);
    }
}
