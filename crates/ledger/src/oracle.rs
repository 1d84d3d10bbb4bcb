use std::sync::{Arc, RwLock};

use alloy_primitives::U256;
use escrow_core::error::LedgerError;
use escrow_core::pricing::{usd_to_native, PriceRound, USD_DECIMALS};

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("price feed unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to the latest round of an external price feed.
pub trait PriceFeed: Send + Sync {
    fn latest_round(&self) -> Result<PriceRound, FeedError>;
}

/// Converts USD amounts to wei by re-reading the feed on every call.
#[derive(Clone)]
pub struct PriceOracle {
    feed: Arc<dyn PriceFeed>,
}

impl PriceOracle {
    pub fn new(feed: Arc<dyn PriceFeed>) -> Self {
        Self { feed }
    }

    pub fn latest_round(&self) -> Result<PriceRound, LedgerError> {
        self.feed
            .latest_round()
            .map_err(|e| LedgerError::PriceUnavailable(e.to_string()))
    }

    pub fn convert(&self, usd_amount: U256) -> Result<U256, LedgerError> {
        let round = self.latest_round()?;
        usd_to_native(usd_amount, &round)
    }
}

/// Feed whose answer is set by hand. Used by the dev chain and tests.
#[derive(Debug)]
pub struct ManualPriceFeed {
    round: RwLock<Result<PriceRound, String>>,
}

impl ManualPriceFeed {
    pub fn new(round: PriceRound) -> Self {
        Self {
            round: RwLock::new(Ok(round)),
        }
    }

    /// Feed answering `dollars` per native unit at the USD scale.
    pub fn with_usd_price(dollars: i128) -> Self {
        Self::new(Self::round_for(dollars))
    }

    pub fn set_usd_price(&self, dollars: i128) {
        self.set_round(Self::round_for(dollars));
    }

    pub fn set_round(&self, round: PriceRound) {
        if let Ok(mut guard) = self.round.write() {
            *guard = Ok(round);
        }
    }

    /// Makes subsequent reads fail until a price is set again.
    pub fn fail(&self, reason: &str) {
        if let Ok(mut guard) = self.round.write() {
            *guard = Err(reason.to_string());
        }
    }

    fn round_for(dollars: i128) -> PriceRound {
        PriceRound {
            answer: dollars * 10i128.pow(USD_DECIMALS as u32),
            decimals: USD_DECIMALS,
        }
    }
}

impl PriceFeed for ManualPriceFeed {
    fn latest_round(&self) -> Result<PriceRound, FeedError> {
        let guard = self
            .round
            .read()
            .map_err(|_| FeedError::Unavailable("feed lock poisoned".to_string()))?;
        guard.clone().map_err(FeedError::Unavailable)
    }
}
