use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::orders::Side;

/// Where a trade is in its on-ledger life.
///
/// ```text
/// pending -> settling -> settled
///               |  ^
///               v  |
///             failed
/// ```
/// Nothing leaves `settled`; `failed` may re-enter `settling` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Settling,
    Settled,
    Failed,
}

impl SettlementStatus {
    pub fn can_transition_to(self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Pending, Settling) | (Failed, Settling) | (Settling, Settled) | (Settling, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Settling => "settling",
            SettlementStatus::Settled => "settled",
            SettlementStatus::Failed => "failed",
        }
    }
}

/// A trade represents one match increment between a resting and an incoming order.
///
/// # Terminology
/// - **Maker**: The order that was already resting in the order book (providing liquidity).
/// - **Taker**: The incoming order that crossed the book (taking liquidity).
///
/// # Behavior
/// - The trade always executes at the **maker's price** (book price).
/// - `side` is the maker's side.
/// - Created once by the recorder; afterwards only the settlement state fields change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub pair: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
    pub maker_order_id: String,
    pub taker_order_id: String,
    pub maker_identity: String,
    pub taker_identity: String,
    /// Journal sequence of the submission that produced this trade.
    pub sequence: u64,
    pub created_at: SystemTime,
    pub settlement_status: SettlementStatus,
    pub settlement_error: Option<String>,
    /// False once a permanent settlement error was recorded.
    pub retryable: bool,
    pub retry_count: u32,
    pub last_attempt_at: Option<SystemTime>,
    pub ledger_tx_reference: Option<String>,
    pub settled_at: Option<SystemTime>,
}

impl Trade {
    /// Deterministic id so a replayed submission maps onto the same trade.
    pub fn make_id(pair: &str, sequence: u64, index: usize) -> String {
        format!("{pair}-{sequence}-{index}")
    }
}

#[cfg(test)]
mod tests {
    use super::SettlementStatus::*;

    #[test]
    fn settled_is_terminal() {
        for next in [Pending, Settling, Settled, Failed] {
            assert!(!Settled.can_transition_to(next));
        }
    }

    #[test]
    fn pending_cannot_skip_settling() {
        assert!(!Pending.can_transition_to(Settled));
        assert!(!Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Settling));
        assert!(Failed.can_transition_to(Settling));
        assert!(!Failed.can_transition_to(Settled));
    }
}
