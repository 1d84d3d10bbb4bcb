pub mod api;
pub mod config;
pub mod persistence;
pub mod service;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use contract_client::{ChainError, ContractClient, EscrowChain, LocalChain};
use escrow_ledger::{JobLedger, ManualPriceFeed, PriceOracle};
use orchestrator::{OrchestratorConfig, TransactionOrchestrator};
use reconciler::{MemoryStatusStore, Reconciler, ReconcilerConfig};

use crate::config::{ChainMode, DevChainConfig, GatewayConfig};
use crate::service::EscrowService;

/// Handles to the in-process chain when running without an RPC endpoint.
#[derive(Clone)]
pub struct DevChain {
    pub chain: LocalChain,
    pub feed: Arc<ManualPriceFeed>,
}

pub struct AppState {
    pub service: EscrowService,
    pub reconciler: Arc<Reconciler>,
    pub mirror: MemoryStatusStore,
    pub dev: Option<DevChain>,
    pub config: GatewayConfig,
}

/// Wires chain, orchestrator, reconciler and service from `config`.
pub fn build_state(config: GatewayConfig, mirror: MemoryStatusStore) -> Result<Arc<AppState>, ChainError> {
    let (chain, dev): (Arc<dyn EscrowChain>, Option<DevChain>) = match &config.chain {
        ChainMode::Dev(dev_config) => {
            let dev = dev_chain(dev_config);
            (Arc::new(dev.chain.clone()), Some(dev))
        }
        ChainMode::Rpc(rpc) => {
            let keys: Vec<&str> = rpc.private_keys.iter().map(String::as_str).collect();
            let client = ContractClient::new(
                &rpc.rpc_url,
                rpc.contract_address,
                rpc.price_feed_address,
                &keys,
            )?;
            tracing::info!(
                contract = %client.contract_address,
                price_feed = %client.price_feed_address,
                signers = client.signer_addresses().len(),
                "contract client ready"
            );
            (Arc::new(client), None)
        }
    };

    let orchestrator = Arc::new(TransactionOrchestrator::new(
        chain,
        OrchestratorConfig {
            write_timeout: config.write_timeout,
            read_timeout: config.read_timeout,
            funding_buffer_bps: config.funding_buffer_bps,
            ..OrchestratorConfig::default()
        },
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(mirror.clone()),
        orchestrator.clone(),
        ReconcilerConfig {
            interval: config.reconcile_interval,
            grace: config.reconcile_grace,
        },
    ));
    let service = EscrowService::new(orchestrator, reconciler.clone(), config.write_timeout);

    Ok(Arc::new(AppState {
        service,
        reconciler,
        mirror,
        dev,
        config,
    }))
}

fn dev_chain(config: &DevChainConfig) -> DevChain {
    let feed = Arc::new(ManualPriceFeed::with_usd_price(config.eth_usd_price));
    let ledger = JobLedger::with_policy(
        config.platform_owner,
        PriceOracle::new(feed.clone()),
        config.surplus_policy,
    );
    tracing::info!(
        price = config.eth_usd_price,
        owner = %config.platform_owner,
        policy = ?config.surplus_policy,
        "running against in-process dev chain"
    );
    DevChain {
        chain: LocalChain::new(ledger),
        feed,
    }
}

pub fn setup_test_gateway() -> Arc<AppState> {
    let config = GatewayConfig {
        server_addr: "127.0.0.1:0".parse().unwrap(),
        chain: ChainMode::Dev(DevChainConfig {
            eth_usd_price: config::DEFAULT_DEV_PRICE_USD,
            surplus_policy: Default::default(),
            platform_owner: config::DEFAULT_DEV_OWNER,
        }),
        network_id: None,
        data_dir: PathBuf::from("."),
        snapshot_interval: Duration::from_secs(10),
        reconcile_interval: Duration::from_secs(30),
        reconcile_grace: Duration::ZERO,
        write_timeout: Duration::from_secs(30),
        read_timeout: Duration::from_secs(10),
        funding_buffer_bps: 100,
    };

    build_state(config, MemoryStatusStore::new()).unwrap()
}
