use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;
use escrow_ledger::SurplusPolicy;

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DEV_PRICE_USD: i128 = 3000;
pub const DEFAULT_DEV_OWNER: Address = Address::repeat_byte(0xfe);

const PLACEHOLDER_RPC_MARKERS: [&str; 2] = ["YOUR_INFURA_KEY", "YOUR_PROJECT_ID"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("ETHEREUM_RPC_URL still holds a placeholder; set a real endpoint")]
    PlaceholderRpcUrl,
}

/// In-process ledger used when no RPC endpoint is configured.
#[derive(Debug, Clone)]
pub struct DevChainConfig {
    pub eth_usd_price: i128,
    pub surplus_policy: SurplusPolicy,
    pub platform_owner: Address,
}

#[derive(Clone)]
pub struct RpcConfig {
    pub rpc_url: String,
    pub contract_address: Address,
    pub price_feed_address: Address,
    pub private_keys: Vec<String>,
}

impl fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConfig")
            .field("rpc_url", &self.rpc_url)
            .field("contract_address", &self.contract_address)
            .field("price_feed_address", &self.price_feed_address)
            .field("private_keys", &format_args!("[{} redacted]", self.private_keys.len()))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ChainMode {
    Dev(DevChainConfig),
    Rpc(RpcConfig),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server_addr: SocketAddr,
    pub chain: ChainMode,
    pub network_id: Option<u64>,
    pub data_dir: PathBuf,
    pub snapshot_interval: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_grace: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub funding_buffer_bps: u32,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server_addr = parse_or(&get, "SERVER_ADDR", || {
            DEFAULT_SERVER_ADDR.parse().map_err(|_| ConfigError::Invalid {
                var: "SERVER_ADDR",
                value: DEFAULT_SERVER_ADDR.to_string(),
            })
        })?;

        let chain = match get("ETHEREUM_RPC_URL") {
            Some(rpc_url) => {
                if PLACEHOLDER_RPC_MARKERS.iter().any(|m| rpc_url.contains(m)) {
                    return Err(ConfigError::PlaceholderRpcUrl);
                }
                let contract_address = required::<Address, _>(&get, "CONTRACT_ADDRESS")?;
                let price_feed_address = required::<Address, _>(&get, "PRICE_FEED_ADDRESS")?;
                let private_keys: Vec<String> = get("PRIVATE_KEYS")
                    .ok_or(ConfigError::Missing("PRIVATE_KEYS"))?
                    .split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
                if private_keys.is_empty() {
                    return Err(ConfigError::Missing("PRIVATE_KEYS"));
                }
                ChainMode::Rpc(RpcConfig {
                    rpc_url,
                    contract_address,
                    price_feed_address,
                    private_keys,
                })
            }
            None => ChainMode::Dev(DevChainConfig {
                eth_usd_price: parse_or(&get, "DEV_ETH_USD_PRICE", || Ok(DEFAULT_DEV_PRICE_USD))?,
                surplus_policy: parse_or(&get, "SURPLUS_POLICY", || Ok(SurplusPolicy::default()))?,
                platform_owner: parse_or(&get, "DEV_PLATFORM_OWNER", || Ok(DEFAULT_DEV_OWNER))?,
            }),
        };

        Ok(Self {
            server_addr,
            chain,
            network_id: optional(&get, "NETWORK_ID")?,
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            snapshot_interval: secs(&get, "SNAPSHOT_INTERVAL_SECS", 10)?,
            reconcile_interval: secs(&get, "RECONCILE_INTERVAL_SECS", 30)?,
            reconcile_grace: secs(&get, "RECONCILE_GRACE_SECS", 120)?,
            write_timeout: secs(&get, "WRITE_TIMEOUT_SECS", 30)?,
            read_timeout: secs(&get, "READ_TIMEOUT_SECS", 10)?,
            funding_buffer_bps: parse_or(&get, "FUNDING_BUFFER_BPS", || Ok(100))?,
        })
    }

    pub fn is_dev(&self) -> bool {
        matches!(self.chain, ChainMode::Dev(_))
    }
}

fn optional<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}

fn required<T, G>(get: &G, var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    optional(get, var)?.ok_or(ConfigError::Missing(var))
}

fn parse_or<T, G, D>(get: &G, var: &'static str, default: D) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
    D: FnOnce() -> Result<T, ConfigError>,
{
    match optional(get, var)? {
        Some(value) => Ok(value),
        None => default(),
    }
}

fn secs<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, var, || Ok(default)).map(Duration::from_secs)
}
