use std::collections::HashMap;
use std::str::FromStr;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, I256};
use alloy::providers::{PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use escrow_core::ids::{JobId, TxHash};
use escrow_core::job::LedgerJob;
use escrow_core::pricing::PriceRound;

use crate::{ChainError, EscrowChain, Operation, PendingTx, PostJob, TxReceipt};

sol! {
    #[sol(rpc)]
    contract FreelanceEscrow {
        function postJob(uint64 jobId, address freelancer, uint256 usdAmount, address client) external payable;
        function markJobCompleted(uint64 jobId) external;
        function cancelJob(uint64 jobId) external;
        function getJobDetails(uint64 jobId) external view returns (
            address client,
            address freelancer,
            uint256 usdAmount,
            uint256 ethAmount,
            bool isCompleted,
            bool isPaid
        );

        event JobPosted(uint64 indexed jobId, address indexed client, address indexed freelancer, uint256 usdAmount, uint256 ethAmount);
        event JobCompleted(uint64 indexed jobId, uint256 fee, uint256 payout);
        event JobCancelled(uint64 indexed jobId, uint256 refund);
    }

    #[sol(rpc)]
    interface AggregatorV3Interface {
        function decimals() external view returns (uint8);
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );
    }
}

/// JSON-RPC client for the deployed escrow contract and its price feed.
///
/// Holds one signer per custodied payer; each write is sent from the
/// account that the ledger checks against.
pub struct ContractClient {
    rpc_url: Url,
    pub contract_address: Address,
    pub price_feed_address: Address,
    signers: HashMap<Address, PrivateKeySigner>,
}

impl ContractClient {
    pub fn new(
        rpc_url: &str,
        contract_address: Address,
        price_feed_address: Address,
        private_keys: &[&str],
    ) -> Result<Self, ChainError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| ChainError::InvalidConfig(format!("{e}")))?;

        let mut signers = HashMap::new();
        for key in private_keys {
            let signer = PrivateKeySigner::from_str(key)
                .map_err(|e| ChainError::InvalidConfig(e.to_string()))?;
            signers.insert(signer.address(), signer);
        }
        if signers.is_empty() {
            return Err(ChainError::InvalidConfig(
                "at least one private key is required".to_string(),
            ));
        }

        Ok(Self {
            rpc_url: url,
            contract_address,
            price_feed_address,
            signers,
        })
    }

    pub fn signer_addresses(&self) -> Vec<Address> {
        self.signers.keys().copied().collect()
    }

    fn wallet_for(&self, from: Address) -> Result<EthereumWallet, ChainError> {
        let signer = self
            .signers
            .get(&from)
            .cloned()
            .ok_or(ChainError::UnknownSigner(from))?;
        Ok(EthereumWallet::from(signer))
    }

    fn signing_provider(&self, from: Address) -> Result<impl Provider + Clone, ChainError> {
        let wallet = self.wallet_for(from)?;
        Ok(ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(self.rpc_url.clone()))
    }

    fn read_provider(&self) -> impl Provider + Clone {
        ProviderBuilder::new().connect_http(self.rpc_url.clone())
    }
}

#[async_trait]
impl EscrowChain for ContractClient {
    async fn send_post(&self, req: &PostJob) -> Result<PendingTx, ChainError> {
        let provider = self.signing_provider(req.payer)?;
        let contract = FreelanceEscrow::new(self.contract_address, provider);

        let pending_tx = contract
            .postJob(req.job_id.0, req.payee, req.usd_amount, req.payer)
            .from(req.payer)
            .value(req.value)
            .send()
            .await
            .map_err(|e| ChainError::from_send_error(e.to_string()))?;

        let tx_hash = TxHash::from(*pending_tx.tx_hash());
        tracing::info!(job_id = %req.job_id, %tx_hash, "postJob broadcast");

        Ok(PendingTx {
            operation: Operation::Post,
            job_id: req.job_id,
            tx_hash,
        })
    }

    async fn send_complete(&self, job_id: JobId, caller: Address) -> Result<PendingTx, ChainError> {
        let provider = self.signing_provider(caller)?;
        let contract = FreelanceEscrow::new(self.contract_address, provider);

        let pending_tx = contract
            .markJobCompleted(job_id.0)
            .from(caller)
            .send()
            .await
            .map_err(|e| ChainError::from_send_error(e.to_string()))?;

        let tx_hash = TxHash::from(*pending_tx.tx_hash());
        tracing::info!(%job_id, %tx_hash, "markJobCompleted broadcast");

        Ok(PendingTx {
            operation: Operation::Complete,
            job_id,
            tx_hash,
        })
    }

    async fn send_cancel(&self, job_id: JobId, caller: Address) -> Result<PendingTx, ChainError> {
        let provider = self.signing_provider(caller)?;
        let contract = FreelanceEscrow::new(self.contract_address, provider);

        let pending_tx = contract
            .cancelJob(job_id.0)
            .from(caller)
            .send()
            .await
            .map_err(|e| ChainError::from_send_error(e.to_string()))?;

        let tx_hash = TxHash::from(*pending_tx.tx_hash());
        tracing::info!(%job_id, %tx_hash, "cancelJob broadcast");

        Ok(PendingTx {
            operation: Operation::Cancel,
            job_id,
            tx_hash,
        })
    }

    async fn wait_for_receipt(&self, pending: &PendingTx) -> Result<TxReceipt, ChainError> {
        let provider = self.read_provider();
        let receipt = PendingTransactionBuilder::new(provider.root().clone(), pending.tx_hash.0.into())
            .get_receipt()
            .await
            .map_err(|e| ChainError::TransactionFailed(e.to_string()))?;

        let success = receipt.status();
        Ok(TxReceipt {
            tx_hash: TxHash::from(receipt.transaction_hash),
            block_number: receipt.block_number.unwrap_or_default(),
            gas_used: receipt.gas_used,
            success,
            revert: None,
        })
    }

    async fn job_details(&self, job_id: JobId) -> Result<LedgerJob, ChainError> {
        let contract = FreelanceEscrow::new(self.contract_address, self.read_provider());

        let res = contract
            .getJobDetails(job_id.0)
            .call()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))?;

        Ok(LedgerJob {
            payer: res.client,
            payee: res.freelancer,
            usd_amount: res.usdAmount,
            native_amount: res.ethAmount,
            is_completed: res.isCompleted,
            is_paid: res.isPaid,
        })
    }

    async fn latest_price(&self) -> Result<PriceRound, ChainError> {
        let feed = AggregatorV3Interface::new(self.price_feed_address, self.read_provider());

        let decimals = feed
            .decimals()
            .call()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))?;
        let round = feed
            .latestRoundData()
            .call()
            .await
            .map_err(|e| ChainError::CallFailed(e.to_string()))?;

        Ok(PriceRound {
            answer: feed_answer(round.answer),
            decimals,
        })
    }
}

/// Out-of-range answers collapse to zero, which conversion rejects.
fn feed_answer(answer: I256) -> i128 {
    answer.to_string().parse().unwrap_or(0)
}
