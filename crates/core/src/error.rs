use serde::{Deserialize, Serialize};

/// Rejections raised by the job ledger. These are final and never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum LedgerError {
    #[error("unauthorized: caller is not the job payer")]
    Unauthorized,

    #[error("job already completed")]
    AlreadyCompleted,

    #[error("job already paid")]
    AlreadyPaid,

    #[error("insufficient funds for converted amount")]
    InsufficientFunds,

    #[error("job already exists")]
    JobAlreadyExists,

    #[error("price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("native transfer failed")]
    TransferFailed,
}

impl LedgerError {
    /// Decodes a revert reason from a node error message. Matches both the
    /// custom error names and the require strings the escrow contract emits.
    pub fn from_revert(message: &str) -> Option<Self> {
        let patterns = [
            (["JobAlreadyExists", "Job already exists"], LedgerError::JobAlreadyExists),
            (["InsufficientFunds", "Insufficient ETH"], LedgerError::InsufficientFunds),
            (["Unauthorized", "Only client"], LedgerError::Unauthorized),
            (["AlreadyCompleted", "already completed"], LedgerError::AlreadyCompleted),
            (["AlreadyPaid", "already paid"], LedgerError::AlreadyPaid),
            (["TransferFailed", "Transfer failed"], LedgerError::TransferFailed),
        ];

        for (needles, err) in patterns {
            if needles.iter().any(|n| message.contains(n)) {
                return Some(err);
            }
        }

        if message.contains("PriceUnavailable") || message.contains("Invalid price") {
            return Some(LedgerError::PriceUnavailable(message.to_string()));
        }

        None
    }
}
