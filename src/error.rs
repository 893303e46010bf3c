//! Crate-wide error type.
//!
//! Every domain failure funnels through [`BridgeError`] so tool orchestrators
//! (`tools.rs`) can map it to the `{success: false, error}` envelope instead of
//! an HTTP 500 for anything short of a genuine internal fault.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("not a PromptPay QR")]
    NotPromptPay,

    #[error("invalid account id: {0}")]
    InvalidAccountId(String),

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("quote has expired")]
    QuoteExpired,

    #[error("quote not found: {0}")]
    QuoteNotFound(String),

    #[error("amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    #[error("confirmation timed out")]
    ConfirmationTimeout,

    #[error("settlement failed: {0}")]
    SettlementFailed(String),

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("signature expired")]
    SignatureExpired,

    #[error("network is offline")]
    NetworkOffline,

    #[error("illegal order transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("already syncing")]
    AlreadySyncing,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
