//! Error types for rewards-redemption

use thiserror::Error;

/// Infrastructure failures from the backing stores
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Typed outcome of a redemption, ledger or verification request
///
/// Every variant is recoverable at the request level; none are retried.
#[derive(Error, Debug)]
pub enum RedemptionError {
    #[error("Reward not found: {0}")]
    RewardNotFound(String),

    #[error("Reward is not currently active: {0}")]
    RewardInactive(String),

    #[error("Points mismatch: reward costs {expected} points, got {actual}")]
    PointsMismatch { expected: i64, actual: i64 },

    #[error("Reward has no remaining inventory: {0}")]
    RewardSoldOut(String),

    #[error("Redemption code not found")]
    CodeNotFound,

    #[error("Redemption not found: {0}")]
    RedemptionNotFound(String),

    #[error("This redemption is for a different business")]
    BusinessMismatch,

    #[error("This redemption has already been fulfilled")]
    AlreadyFulfilled,

    #[error("This redemption has expired")]
    RedemptionExpired,

    #[error("This redemption has been cancelled")]
    RedemptionCancelled,

    #[error("Cannot move redemption from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("Balance {balance} cannot absorb {amount} more points")]
    BalanceOverflow { balance: i64, amount: i64 },

    #[error("Insufficient points. You have {available} points but need {required} points.")]
    InsufficientPoints { available: i64, required: i64 },

    #[error("Reward {0} is not an affiliate reward")]
    NotAffiliateReward(String),

    #[error("Reward {0} has no affiliate link")]
    MissingAffiliateLink(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RedemptionError {
    /// Stable machine-readable kind, used in API responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RewardNotFound(_) => "REWARD_NOT_FOUND",
            Self::RewardInactive(_) => "REWARD_INACTIVE",
            Self::PointsMismatch { .. } => "POINTS_MISMATCH",
            Self::RewardSoldOut(_) => "REWARD_SOLD_OUT",
            Self::CodeNotFound => "CODE_NOT_FOUND",
            Self::RedemptionNotFound(_) => "REDEMPTION_NOT_FOUND",
            Self::BusinessMismatch => "BUSINESS_MISMATCH",
            Self::AlreadyFulfilled => "ALREADY_FULFILLED",
            Self::RedemptionExpired => "REDEMPTION_EXPIRED",
            Self::RedemptionCancelled => "REDEMPTION_CANCELLED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InsufficientPoints { .. } => "INSUFFICIENT_POINTS",
            Self::BalanceOverflow { .. } => "BALANCE_OVERFLOW",
            Self::NotAffiliateReward(_) => "NOT_AFFILIATE_REWARD",
            Self::MissingAffiliateLink(_) => "MISSING_AFFILIATE_LINK",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_mismatch_message_names_cost() {
        let err = RedemptionError::PointsMismatch { expected: 100, actual: 50 };
        assert_eq!(err.to_string(), "Points mismatch: reward costs 100 points, got 50");
        assert_eq!(err.kind(), "POINTS_MISMATCH");
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: RedemptionError = StorageError::Conflict("code taken".into()).into();
        assert_eq!(err.to_string(), "Conflict: code taken");
        assert_eq!(err.kind(), "STORAGE_ERROR");
    }
}
