//! Reference implementation of the escrow job ledger.
//!
//! [`JobLedger`] is the authoritative state machine that the deployed escrow
//! contract implements on-chain. The local dev chain and the test suites run
//! against it directly.

pub mod ledger;
pub mod oracle;

pub use ledger::{JobLedger, SurplusPolicy};
pub use oracle::{FeedError, ManualPriceFeed, PriceFeed, PriceOracle};
