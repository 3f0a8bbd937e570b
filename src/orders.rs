use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::errors::ValidationError;

/// Represents which side of the market the order is on.
///
/// # Intuition
/// - `Buy` (Bid): The trader wants to purchase the base asset. Bids are served from the **highest price**
///   down, because a higher price means more willingness to buy.
/// - `Sell` (Ask): The trader wants to sell the base asset. Asks are served from the **lowest price**
///   up, because a lower price means more willingness to sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,  // Bid
    Sell, // Ask
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Lifecycle of an order. Terminal states are kept for audit, orders are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

/// Arrival stamp: `sequence` drives time priority, `wall` is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTimestamp {
    pub sequence: u64,
    pub wall: SystemTime,
}

/// A limit order as the engine sees it.
///
/// `signed_payload` is opaque here; only the settlement side interprets it.
/// Invariant: `original_size = remaining_size + sum(fills)` and
/// `status == Filled` iff `remaining_size == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub side: Side,
    pub limit_price: Decimal,
    pub original_size: Decimal,
    pub remaining_size: Decimal,
    pub owner: String,
    pub pair: String,
    #[serde(with = "crate::utils::b64")]
    pub signed_payload: Vec<u8>,
    pub created_at: OrderTimestamp,
    pub status: OrderStatus,
}

impl Order {
    pub fn filled_size(&self) -> Decimal {
        self.original_size - self.remaining_size
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }
}

/// Order submission as it arrives from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    /// Caller-supplied id; one is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub side: Side,
    pub size: Decimal,
    pub limit_price: Decimal,
    pub owner: String,
    pub pair: String,
    #[serde(with = "crate::utils::b64")]
    pub signed_payload: Vec<u8>,
}

impl NewOrder {
    /// Checks the order shape and builds an unsequenced [`Order`].
    ///
    /// The sequence number is assigned by the pair engine when the order is journaled.
    pub fn into_order(self) -> Result<Order, ValidationError> {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let order = Order {
            id,
            side: self.side,
            limit_price: self.limit_price,
            original_size: self.size,
            remaining_size: self.size,
            owner: self.owner,
            pair: self.pair,
            signed_payload: self.signed_payload,
            created_at: OrderTimestamp {
                sequence: 0,
                wall: SystemTime::now(),
            },
            status: OrderStatus::Open,
        };
        validate_shape(&order)?;
        Ok(order)
    }
}

/// Shape checks shared by the API path and the book itself.
pub fn validate_shape(order: &Order) -> Result<(), ValidationError> {
    if order.id.trim().is_empty() {
        return Err(ValidationError::EmptyOrderId);
    }
    if order.owner.trim().is_empty() {
        return Err(ValidationError::EmptyOwner);
    }
    if order.original_size <= Decimal::ZERO || order.remaining_size <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveSize);
    }
    if order.limit_price <= Decimal::ZERO {
        return Err(ValidationError::NonPositivePrice);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_order(size: Decimal, price: Decimal) -> NewOrder {
        NewOrder {
            id: Some("o-1".into()),
            side: Side::Buy,
            size,
            limit_price: price,
            owner: "0xabc".into(),
            pair: "MBTC-MUSDT".into(),
            signed_payload: vec![],
        }
    }

    #[test]
    fn rejects_zero_and_negative_size_or_price() {
        assert_eq!(
            new_order(dec!(0), dec!(100)).into_order().unwrap_err(),
            ValidationError::NonPositiveSize
        );
        assert_eq!(
            new_order(dec!(-1), dec!(100)).into_order().unwrap_err(),
            ValidationError::NonPositiveSize
        );
        assert_eq!(
            new_order(dec!(1), dec!(0)).into_order().unwrap_err(),
            ValidationError::NonPositivePrice
        );
    }

    #[test]
    fn generates_an_id_when_missing() {
        let mut n = new_order(dec!(1), dec!(100));
        n.id = None;
        let order = n.into_order().unwrap();
        assert!(!order.id.is_empty());
        assert_eq!(order.remaining_size, dec!(1));
        assert_eq!(order.status, OrderStatus::Open);
    }

    #[test]
    fn side_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }
}
