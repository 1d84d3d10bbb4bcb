use std::collections::HashMap;
use std::time::Duration;

use escrow_ledger::SurplusPolicy;
use gateway::config::{ChainMode, ConfigError, GatewayConfig, DEFAULT_DEV_PRICE_USD};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
const FEED: &str = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512";
const KEY_0: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const KEY_1: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

#[test]
fn defaults_to_dev_chain() {
    let config = GatewayConfig::from_lookup(lookup(&[])).unwrap();

    assert_eq!(config.server_addr.to_string(), "127.0.0.1:8080");
    assert_eq!(config.reconcile_interval, Duration::from_secs(30));
    assert_eq!(config.reconcile_grace, Duration::from_secs(120));
    assert_eq!(config.write_timeout, Duration::from_secs(30));
    assert_eq!(config.read_timeout, Duration::from_secs(10));
    assert_eq!(config.funding_buffer_bps, 100);
    assert!(config.network_id.is_none());

    let ChainMode::Dev(dev) = &config.chain else {
        panic!("expected dev chain");
    };
    assert_eq!(dev.eth_usd_price, DEFAULT_DEV_PRICE_USD);
    assert_eq!(dev.surplus_policy, SurplusPolicy::RefundAtPost);
}

#[test]
fn rpc_mode_reads_contract_and_keys() {
    let keys = format!("{KEY_0}, {KEY_1},");
    let config = GatewayConfig::from_lookup(lookup(&[
        ("ETHEREUM_RPC_URL", "http://127.0.0.1:8545"),
        ("CONTRACT_ADDRESS", CONTRACT),
        ("PRICE_FEED_ADDRESS", FEED),
        ("PRIVATE_KEYS", keys.as_str()),
        ("NETWORK_ID", "31337"),
        ("WRITE_TIMEOUT_SECS", "45"),
    ]))
    .unwrap();

    assert!(!config.is_dev());
    assert_eq!(config.network_id, Some(31337));
    assert_eq!(config.write_timeout, Duration::from_secs(45));

    let ChainMode::Rpc(rpc) = &config.chain else {
        panic!("expected rpc chain");
    };
    assert_eq!(rpc.contract_address, CONTRACT.parse::<alloy_primitives::Address>().unwrap());
    assert_eq!(rpc.private_keys, vec![KEY_0.to_string(), KEY_1.to_string()]);
    assert!(!format!("{rpc:?}").contains(KEY_0));
}

#[test]
fn rpc_mode_requires_contract_address() {
    let err = GatewayConfig::from_lookup(lookup(&[
        ("ETHEREUM_RPC_URL", "http://127.0.0.1:8545"),
        ("PRICE_FEED_ADDRESS", FEED),
        ("PRIVATE_KEYS", KEY_0),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Missing("CONTRACT_ADDRESS")));
}

#[test]
fn rpc_mode_requires_keys() {
    let err = GatewayConfig::from_lookup(lookup(&[
        ("ETHEREUM_RPC_URL", "http://127.0.0.1:8545"),
        ("CONTRACT_ADDRESS", CONTRACT),
        ("PRICE_FEED_ADDRESS", FEED),
        ("PRIVATE_KEYS", " , "),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Missing("PRIVATE_KEYS")));
}

#[test]
fn placeholder_rpc_url_is_refused() {
    let err = GatewayConfig::from_lookup(lookup(&[(
        "ETHEREUM_RPC_URL",
        "https://sepolia.infura.io/v3/YOUR_INFURA_KEY",
    )]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::PlaceholderRpcUrl));
}

#[test]
fn malformed_values_are_reported() {
    let err = GatewayConfig::from_lookup(lookup(&[("RECONCILE_INTERVAL_SECS", "soon")])).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            var: "RECONCILE_INTERVAL_SECS",
            ..
        }
    ));

    let err = GatewayConfig::from_lookup(lookup(&[("SURPLUS_POLICY", "keep-it")])).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { var: "SURPLUS_POLICY", .. }));
}

#[test]
fn blank_values_fall_back_to_defaults() {
    let config = GatewayConfig::from_lookup(lookup(&[
        ("ETHEREUM_RPC_URL", "  "),
        ("SURPLUS_POLICY", "retain"),
    ]))
    .unwrap();

    let ChainMode::Dev(dev) = &config.chain else {
        panic!("expected dev chain");
    };
    assert_eq!(dev.surplus_policy, SurplusPolicy::Retain);
}
