use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle stage tracked independently in the status mirror.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Deposit,
    Release,
    Refund,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Deposit, Stage::Release, Stage::Refund];

    pub fn initiated(self) -> PaymentStatus {
        match self {
            Stage::Deposit => PaymentStatus::DepositInitiated,
            Stage::Release => PaymentStatus::ReleaseInitiated,
            Stage::Refund => PaymentStatus::RefundInitiated,
        }
    }

    pub fn confirmed(self) -> PaymentStatus {
        match self {
            Stage::Deposit => PaymentStatus::Deposited,
            Stage::Release => PaymentStatus::Released,
            Stage::Refund => PaymentStatus::Refunded,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Deposit => "deposit",
            Stage::Release => "release",
            Stage::Refund => "refund",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mirrored payment status of an escrow job.
///
/// Status only moves along [`ALLOWED_TRANSITIONS`]. The release and refund
/// branches are mutually exclusive once `deposited` is left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    None,
    DepositInitiated,
    Deposited,
    ReleaseInitiated,
    Released,
    RefundInitiated,
    Refunded,
}

/// Every `(from, to)` pair the mirror accepts. Self-edges on the
/// `_initiated` states allow a re-broadcast to overwrite the recorded hash.
pub const ALLOWED_TRANSITIONS: &[(PaymentStatus, PaymentStatus)] = &[
    (PaymentStatus::None, PaymentStatus::DepositInitiated),
    (PaymentStatus::DepositInitiated, PaymentStatus::DepositInitiated),
    (PaymentStatus::DepositInitiated, PaymentStatus::Deposited),
    (PaymentStatus::Deposited, PaymentStatus::ReleaseInitiated),
    (PaymentStatus::Deposited, PaymentStatus::RefundInitiated),
    (PaymentStatus::ReleaseInitiated, PaymentStatus::ReleaseInitiated),
    (PaymentStatus::ReleaseInitiated, PaymentStatus::Released),
    (PaymentStatus::RefundInitiated, PaymentStatus::RefundInitiated),
    (PaymentStatus::RefundInitiated, PaymentStatus::Refunded),
];

impl PaymentStatus {
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        ALLOWED_TRANSITIONS.contains(&(self, next))
    }

    /// Position along the lifecycle. Release and refund share ranks.
    pub fn rank(self) -> u8 {
        match self {
            PaymentStatus::None => 0,
            PaymentStatus::DepositInitiated => 1,
            PaymentStatus::Deposited => 2,
            PaymentStatus::ReleaseInitiated | PaymentStatus::RefundInitiated => 3,
            PaymentStatus::Released | PaymentStatus::Refunded => 4,
        }
    }

    /// Whether `stage` has already been confirmed on the way to this status.
    pub fn is_past(self, stage: Stage) -> bool {
        match stage {
            Stage::Deposit => self.rank() >= PaymentStatus::Deposited.rank(),
            Stage::Release => self == PaymentStatus::Released,
            Stage::Refund => self == PaymentStatus::Refunded,
        }
    }

    /// The stage awaiting confirmation, if this is an `_initiated` status.
    pub fn pending_stage(self) -> Option<Stage> {
        match self {
            PaymentStatus::DepositInitiated => Some(Stage::Deposit),
            PaymentStatus::ReleaseInitiated => Some(Stage::Release),
            PaymentStatus::RefundInitiated => Some(Stage::Refund),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PaymentStatus::Released | PaymentStatus::Refunded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::None => "none",
            PaymentStatus::DepositInitiated => "deposit_initiated",
            PaymentStatus::Deposited => "deposited",
            PaymentStatus::ReleaseInitiated => "release_initiated",
            PaymentStatus::Released => "released",
            PaymentStatus::RefundInitiated => "refund_initiated",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown payment status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PaymentStatus::None),
            "deposit_initiated" => Ok(PaymentStatus::DepositInitiated),
            "deposited" => Ok(PaymentStatus::Deposited),
            "release_initiated" => Ok(PaymentStatus::ReleaseInitiated),
            "released" => Ok(PaymentStatus::Released),
            "refund_initiated" => Ok(PaymentStatus::RefundInitiated),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
