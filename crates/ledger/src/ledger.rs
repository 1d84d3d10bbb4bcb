use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use alloy_primitives::{Address, U256};
use escrow_core::error::LedgerError;
use escrow_core::ids::JobId;
use escrow_core::job::LedgerJob;
use escrow_core::pricing::split_fee;
use serde::{Deserialize, Serialize};

use crate::oracle::PriceOracle;

/// What happens to funds sent above the converted amount at post time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurplusPolicy {
    /// Excess stays with the ledger and is never returned, not even on cancel.
    Retain,
    /// Excess is credited back to the payer inside the same post.
    #[default]
    RefundAtPost,
}

impl FromStr for SurplusPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retain" => Ok(SurplusPolicy::Retain),
            "refund_at_post" | "refund" => Ok(SurplusPolicy::RefundAtPost),
            other => Err(format!("unknown surplus policy: {other}")),
        }
    }
}

/// Keyed job store with the escrow's access control and fund movements.
///
/// Every mutating call either applies all of its effects or none: payouts
/// are checked against recipients before any record or balance changes.
pub struct JobLedger {
    owner: Address,
    oracle: PriceOracle,
    surplus_policy: SurplusPolicy,
    jobs: HashMap<JobId, LedgerJob>,
    held: U256,
    retained_surplus: U256,
    balances: HashMap<Address, U256>,
    rejecting: HashSet<Address>,
}

impl JobLedger {
    pub fn new(owner: Address, oracle: PriceOracle) -> Self {
        Self::with_policy(owner, oracle, SurplusPolicy::default())
    }

    pub fn with_policy(owner: Address, oracle: PriceOracle, surplus_policy: SurplusPolicy) -> Self {
        Self {
            owner,
            oracle,
            surplus_policy,
            jobs: HashMap::new(),
            held: U256::ZERO,
            retained_surplus: U256::ZERO,
            balances: HashMap::new(),
            rejecting: HashSet::new(),
        }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn surplus_policy(&self) -> SurplusPolicy {
        self.surplus_policy
    }

    pub fn oracle(&self) -> &PriceOracle {
        &self.oracle
    }

    /// Escrows a new job and returns the native amount frozen for it.
    pub fn post(
        &mut self,
        job_id: JobId,
        payee: Address,
        usd_amount: U256,
        payer: Address,
        funds_sent: U256,
    ) -> Result<U256, LedgerError> {
        let native_amount = self.oracle.convert(usd_amount)?;
        if funds_sent < native_amount {
            tracing::debug!(
                %job_id,
                required = %native_amount,
                sent = %funds_sent,
                "post rejected: insufficient funds"
            );
            return Err(LedgerError::InsufficientFunds);
        }
        if self.jobs.contains_key(&job_id) {
            return Err(LedgerError::JobAlreadyExists);
        }
        if payer == Address::ZERO {
            return Err(LedgerError::Unauthorized);
        }

        let surplus = funds_sent - native_amount;
        let refund = match self.surplus_policy {
            SurplusPolicy::RefundAtPost if !surplus.is_zero() => vec![(payer, surplus)],
            _ => Vec::new(),
        };
        self.check_recipients(&refund)?;

        self.held += funds_sent;
        self.jobs.insert(
            job_id,
            LedgerJob {
                payer,
                payee,
                usd_amount,
                native_amount,
                is_completed: false,
                is_paid: false,
            },
        );
        if refund.is_empty() {
            self.retained_surplus += surplus;
        } else {
            self.pay_out(&refund);
        }

        tracing::debug!(%job_id, native = %native_amount, surplus = %surplus, "job posted");
        Ok(native_amount)
    }

    /// Releases the escrow: fee to the owner first, remainder to the payee.
    pub fn complete(&mut self, job_id: JobId, caller: Address) -> Result<(), LedgerError> {
        let job = self.authorized_job(job_id, caller)?;
        if job.is_completed {
            return Err(LedgerError::AlreadyCompleted);
        }

        let split = split_fee(job.native_amount);
        let payouts = [(self.owner, split.fee), (job.payee, split.payout)];
        self.check_recipients(&payouts)?;

        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.is_completed = true;
        }
        self.pay_out(&payouts);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.is_paid = true;
        }

        tracing::debug!(%job_id, fee = %split.fee, payout = %split.payout, "job completed");
        Ok(())
    }

    /// Deletes the job and refunds exactly its native amount to the payer.
    pub fn cancel(&mut self, job_id: JobId, caller: Address) -> Result<U256, LedgerError> {
        let job = self.authorized_job(job_id, caller)?;
        if job.is_completed {
            return Err(LedgerError::AlreadyCompleted);
        }
        if job.is_paid {
            return Err(LedgerError::AlreadyPaid);
        }

        let refund = [(job.payer, job.native_amount)];
        self.check_recipients(&refund)?;

        self.jobs.remove(&job_id);
        self.pay_out(&refund);

        tracing::debug!(%job_id, refund = %job.native_amount, "job cancelled");
        Ok(job.native_amount)
    }

    /// Returns the zero record for unknown ids.
    pub fn get_details(&self, job_id: JobId) -> LedgerJob {
        self.jobs.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn quote(&self, usd_amount: U256) -> Result<U256, LedgerError> {
        self.oracle.convert(usd_amount)
    }

    /// Native balance currently held by the ledger.
    pub fn held_balance(&self) -> U256 {
        self.held
    }

    /// Excess deposits kept under [`SurplusPolicy::Retain`].
    pub fn retained_surplus(&self) -> U256 {
        self.retained_surplus
    }

    /// Total paid out to `address` by the ledger.
    pub fn balance_of(&self, address: Address) -> U256 {
        self.balances.get(&address).copied().unwrap_or_default()
    }

    /// Makes every transfer to `address` revert, like a contract without a
    /// payable fallback.
    pub fn reject_transfers_to(&mut self, address: Address) {
        self.rejecting.insert(address);
    }

    pub fn accept_transfers_to(&mut self, address: Address) {
        self.rejecting.remove(&address);
    }

    fn authorized_job(&self, job_id: JobId, caller: Address) -> Result<LedgerJob, LedgerError> {
        let job = self.get_details(job_id);
        if job.is_absent() || job.payer != caller {
            return Err(LedgerError::Unauthorized);
        }
        Ok(job)
    }

    fn check_recipients(&self, payouts: &[(Address, U256)]) -> Result<(), LedgerError> {
        match payouts.iter().find(|(to, _)| self.rejecting.contains(to)) {
            Some((to, amount)) => {
                tracing::debug!(%to, %amount, "transfer rejected by recipient");
                Err(LedgerError::TransferFailed)
            }
            None => Ok(()),
        }
    }

    fn pay_out(&mut self, payouts: &[(Address, U256)]) {
        for (to, amount) in payouts {
            self.held -= *amount;
            *self.balances.entry(*to).or_default() += *amount;
        }
    }
}
