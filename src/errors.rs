use thiserror::Error;

use crate::store::StoreError;

/// Order shape problems. Raised before the book is touched and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("size must be > 0")]
    NonPositiveSize,
    #[error("limit price must be > 0")]
    NonPositivePrice,
    #[error("order id must not be empty")]
    EmptyOrderId,
    #[error("owner identity must not be empty")]
    EmptyOwner,
    #[error("duplicate order id `{0}`")]
    DuplicateOrderId(String),
    #[error("order for pair `{got}` submitted to the `{expected}` book")]
    PairMismatch { expected: String, got: String },
    #[error("order `{order_id}` would trade against resting order `{resting_id}` of the same owner")]
    SelfTrade {
        order_id: String,
        resting_id: String,
    },
}

/// Journal failures. A write failure aborts the submission that caused it.
#[derive(Error, Debug)]
pub enum RecoveryLogError {
    #[error("journal write failed at sequence {sequence}: {source}")]
    Write {
        sequence: u64,
        #[source]
        source: StoreError,
    },
    #[error("journal read failed: {0}")]
    Read(#[source] StoreError),
    #[error("journal gap: expected sequence {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
    #[error("journal entry {sequence} could not be replayed: {reason}")]
    Replay { sequence: u64, reason: String },
}

/// Durable trade/order write failures, surfaced after the persistence layer gave up retrying.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("trade recorder for `{0}` stopped")]
    RecorderStopped(String),
    #[error("`{pair}` recorded up to {recorded}, refusing to record sequence {found}")]
    OutOfOrder {
        pair: String,
        recorded: u64,
        found: u64,
    },
    #[error("`{0}` stopped accepting orders after a recording failure; restart to recover")]
    Halted(String),
}

/// Everything the synchronous order path can fail with.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    RecoveryLog(#[from] RecoveryLogError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("unsupported pair `{0}`")]
    UnknownPair(String),
}

/// Settlement failures. Tracked on the trade, never returned to the order submitter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("network error: {0}")]
    Network(String),
    #[error("ledger reverted: {reason}")]
    Revert { reason: String, retryable: bool },
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("refusing to fill: submitter {address} is the maker of the signed order")]
    SelfFill { address: String },
    #[error("invalid signed payload: {0}")]
    InvalidPayload(String),
    #[error("missing asset decimals for pair `{0}`")]
    MissingAssetMetadata(String),
    #[error("fill amount out of range: {0}")]
    AmountOutOfRange(String),
    #[error("settlement bookkeeping failed: {0}")]
    Persistence(String),
}

impl SettlementError {
    /// Whether the retry sweep may pick the trade up again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SettlementError::Network(_) => true,
            SettlementError::Revert { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
