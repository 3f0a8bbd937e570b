use crate::{
    errors::ValidationError,
    orders::{Order, OrderStatus, Side, validate_shape},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque, btree_map};
use tracing::{debug, info};

/// What to do when an incoming order would trade against a resting order of the same owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfTradePolicy {
    /// Match as with any other counterparty.
    #[default]
    Allow,
    /// Reject the incoming order before touching the book.
    Reject,
    /// Cancel the resting order and the incoming remainder; fills made before stand.
    CancelBoth,
}

/// One increment of a match: `maker` is the resting order **after** the fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub maker: Order,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// The single partially consumed order of a submission, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partial {
    /// A resting order was partly consumed; the incoming order was fully filled.
    Resting(Execution),
    /// The incoming order absorbed fills and rests its remainder.
    Incoming { quantity_processed: Decimal },
    /// The incoming order absorbed fills, then reached a resting order of its own
    /// owner under [`SelfTradePolicy::CancelBoth`]; its remainder was cancelled.
    IncomingCancelled { quantity_processed: Decimal },
}

/// Result of matching one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    /// No fills.
    NoMatch,
    /// Every touched resting order was fully consumed and so was the incoming order.
    Done(Vec<Execution>),
    /// Zero or more fully consumed resting orders plus exactly one partial.
    Partial {
        done: Vec<Execution>,
        partial: Partial,
    },
}

/// Everything one `submit` did to the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub sequence: u64,
    /// The incoming order in its final state (open/filled/cancelled).
    pub incoming: Order,
    pub outcome: MatchOutcome,
    /// Resting orders removed by the self-trade policy.
    pub cancelled: Vec<Order>,
}

impl MatchEvent {
    /// Every execution in match order: done orders first, then a resting partial.
    pub fn executions(&self) -> Vec<&Execution> {
        match &self.outcome {
            MatchOutcome::NoMatch => Vec::new(),
            MatchOutcome::Done(done) => done.iter().collect(),
            MatchOutcome::Partial { done, partial } => {
                let mut all: Vec<&Execution> = done.iter().collect();
                if let Partial::Resting(exec) = partial {
                    all.push(exec);
                }
                all
            }
        }
    }

    /// Every order whose state this event changed, in its final state.
    pub fn touched_orders(&self) -> impl Iterator<Item = &Order> {
        std::iter::once(&self.incoming)
            .chain(self.executions().into_iter().map(|e| &e.maker))
            .chain(&self.cancelled)
    }

    /// Quantity taken out of the incoming order.
    pub fn filled_quantity(&self) -> Decimal {
        self.executions().iter().map(|e| e.quantity).sum()
    }
}

/// Full book state at a sequence number, orders listed in priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub pair: String,
    pub sequence: u64,
    /// Price descending, then oldest first.
    pub bids: Vec<Order>,
    /// Price ascending, then oldest first.
    pub asks: Vec<Order>,
}

/// Aggregated price level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
    pub orders: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDepth {
    pub pair: String,
    pub sequence: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// An [`OrderBook`] stores **active** buy and sell orders for one pair in two
/// separate [`BTreeMap`]s:
/// - `bids` (buy orders)
/// - `asks` (sell orders)
///
/// Each price level (key) has a FIFO queue of orders stored in a [`VecDeque`]
/// to maintain **price-time** priority.
///
/// The book is pure: no I/O, no clock reads. Given the same sequence of
/// submissions and cancels it always ends in the same state.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pair: String,
    /// Buy orders, keyed by price in ascending order.
    ///
    /// For matching, we iterate **in reverse** to find the highest bid first.
    bids: BTreeMap<Decimal, VecDeque<Order>>,
    /// Sell orders, keyed by price in ascending order.
    ///
    /// For matching, we iterate **forwards** to find the lowest ask first.
    asks: BTreeMap<Decimal, VecDeque<Order>>,
    /// Resting order id -> (side, price level).
    index: HashMap<String, (Side, Decimal)>,
    self_trade: SelfTradePolicy,
    /// Last applied sequence number.
    sequence: u64,
}

/// Internal enum to unify forward (`Iter`) and reverse (`Rev<Iter>`) BTreeMap iteration.
///
/// - [`EitherIter::Fwd`] handles ascending iteration over prices (asks, best first).
/// - [`EitherIter::Rev`] handles descending iteration (bids, best first).
enum EitherIter<'a> {
    Fwd(btree_map::Iter<'a, Decimal, VecDeque<Order>>),
    Rev(std::iter::Rev<btree_map::Iter<'a, Decimal, VecDeque<Order>>>),
}

impl<'a> Iterator for EitherIter<'a> {
    type Item = (&'a Decimal, &'a VecDeque<Order>);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            EitherIter::Fwd(iter) => iter.next(),
            EitherIter::Rev(iter) => iter.next(),
        }
    }
}

/// Does a resting price cross an incoming limit?
fn crosses(incoming_side: Side, limit: Decimal, resting_price: Decimal) -> bool {
    match incoming_side {
        Side::Buy => limit >= resting_price,
        Side::Sell => limit <= resting_price,
    }
}

impl OrderBook {
    /// Creates a new, empty [`OrderBook`] for `pair`.
    pub fn new(pair: impl Into<String>, self_trade: SelfTradePolicy) -> Self {
        Self {
            pair: pair.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            self_trade,
            sequence: 0,
        }
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn self_trade_policy(&self) -> SelfTradePolicy {
        self.self_trade
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.index.contains_key(order_id)
    }

    pub fn get(&self, order_id: &str) -> Option<&Order> {
        let (side, price) = self.index.get(order_id)?;
        self.side(*side)
            .get(price)?
            .iter()
            .find(|o| o.id == order_id)
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    fn side(&self, side: Side) -> &BTreeMap<Decimal, VecDeque<Order>> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    /// Price levels of `side`, best first.
    fn levels(&self, side: Side) -> EitherIter<'_> {
        match side {
            Side::Buy => EitherIter::Rev(self.bids.iter().rev()),
            Side::Sell => EitherIter::Fwd(self.asks.iter()),
        }
    }

    /// Everything `submit` would reject, without mutating the book.
    pub fn check(&self, incoming: &Order) -> Result<(), ValidationError> {
        validate_shape(incoming)?;
        if incoming.pair != self.pair {
            return Err(ValidationError::PairMismatch {
                expected: self.pair.clone(),
                got: incoming.pair.clone(),
            });
        }
        if self.index.contains_key(&incoming.id) {
            return Err(ValidationError::DuplicateOrderId(incoming.id.clone()));
        }
        if self.self_trade == SelfTradePolicy::Reject {
            if let Some(resting) = self.first_self_match(incoming) {
                return Err(ValidationError::SelfTrade {
                    order_id: incoming.id.clone(),
                    resting_id: resting.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Walks the crossing liquidity the incoming order would consume and returns
    /// the first resting order with the same owner.
    fn first_self_match(&self, incoming: &Order) -> Option<&Order> {
        let mut left = incoming.remaining_size;
        for (&price, queue) in self.levels(incoming.side.opposite()) {
            if !crosses(incoming.side, incoming.limit_price, price) {
                break;
            }
            for resting in queue {
                if left <= Decimal::ZERO {
                    return None;
                }
                if resting.owner == incoming.owner {
                    return Some(resting);
                }
                left -= left.min(resting.remaining_size);
            }
        }
        None
    }

    /// Matches an incoming **limit** order against the opposite side, then rests any remainder.
    ///
    /// # Behavior
    /// - A buy consumes `asks` from lowest to highest while `limit >= best ask`.
    /// - A sell consumes `bids` from highest to lowest while `limit <= best bid`.
    /// - Within a level, the oldest order fills first.
    /// - Each fill is `min(incoming.remaining, resting.remaining)` and executes at
    ///   the **resting** price.
    ///
    /// The order is stamped with the next sequence number.
    pub fn submit(&mut self, mut incoming: Order) -> Result<MatchEvent, ValidationError> {
        self.check(&incoming)?;
        self.sequence += 1;
        incoming.created_at.sequence = self.sequence;
        incoming.remaining_size = incoming.original_size;
        incoming.status = OrderStatus::Open;
        debug!(pair = %self.pair, order_id = %incoming.id, sequence = self.sequence, "matching incoming order");

        let Self {
            bids,
            asks,
            index,
            self_trade,
            ..
        } = &mut *self;
        let book_side = match incoming.side {
            Side::Buy => asks,
            Side::Sell => bids,
        };

        let mut done = Vec::new();
        let mut resting_partial = None;
        let mut cancelled = Vec::new();

        while incoming.remaining_size > Decimal::ZERO {
            let best = match incoming.side {
                Side::Buy => book_side.first_entry(),
                Side::Sell => book_side.last_entry(),
            };
            let Some(mut level) = best else { break };
            let price = *level.key();
            if !crosses(incoming.side, incoming.limit_price, price) {
                break;
            }
            let queue = level.get_mut();
            let Some(resting) = queue.front_mut() else {
                level.remove();
                continue;
            };

            if *self_trade == SelfTradePolicy::CancelBoth && resting.owner == incoming.owner {
                if let Some(mut own) = queue.pop_front() {
                    own.status = OrderStatus::Cancelled;
                    index.remove(&own.id);
                    info!(order_id = %own.id, "self-trade: cancelling resting order");
                    cancelled.push(own);
                }
                if queue.is_empty() {
                    level.remove();
                }
                incoming.status = OrderStatus::Cancelled;
                break;
            }

            // Determine how many units to fill in this match
            let quantity = incoming.remaining_size.min(resting.remaining_size);
            incoming.remaining_size -= quantity;
            resting.remaining_size -= quantity;

            if resting.remaining_size.is_zero() {
                if let Some(mut filled) = queue.pop_front() {
                    filled.status = OrderStatus::Filled;
                    index.remove(&filled.id);
                    done.push(Execution {
                        maker: filled,
                        price,
                        quantity,
                    });
                }
                if queue.is_empty() {
                    level.remove();
                }
            } else {
                // incoming is exhausted, the loop ends here
                resting_partial = Some(Execution {
                    maker: resting.clone(),
                    price,
                    quantity,
                });
            }
        }

        let processed = incoming.filled_size();
        if incoming.remaining_size.is_zero() {
            incoming.status = OrderStatus::Filled;
        } else if incoming.status == OrderStatus::Open {
            let own_side = match incoming.side {
                Side::Buy => &mut self.bids,
                Side::Sell => &mut self.asks,
            };
            own_side
                .entry(incoming.limit_price)
                .or_default()
                .push_back(incoming.clone());
            self.index
                .insert(incoming.id.clone(), (incoming.side, incoming.limit_price));
        }

        let outcome = match resting_partial {
            Some(exec) => MatchOutcome::Partial {
                done,
                partial: Partial::Resting(exec),
            },
            None if processed.is_zero() => MatchOutcome::NoMatch,
            None if incoming.remaining_size.is_zero() => MatchOutcome::Done(done),
            None if incoming.status == OrderStatus::Cancelled => MatchOutcome::Partial {
                done,
                partial: Partial::IncomingCancelled {
                    quantity_processed: processed,
                },
            },
            None => MatchOutcome::Partial {
                done,
                partial: Partial::Incoming {
                    quantity_processed: processed,
                },
            },
        };

        info!(
            pair = %self.pair,
            order_id = %incoming.id,
            sequence = self.sequence,
            filled = %processed,
            status = ?incoming.status,
            "order processed"
        );
        Ok(MatchEvent {
            sequence: self.sequence,
            incoming,
            outcome,
            cancelled,
        })
    }

    /// Removes a resting order. Returns the cancelled order, or `None` if it is not resting.
    ///
    /// Only a successful cancel consumes a sequence number.
    pub fn cancel_order(&mut self, order_id: &str) -> Option<Order> {
        let (side, price) = self.index.remove(order_id)?;
        let book_side = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let queue = book_side.get_mut(&price)?;
        let pos = queue.iter().position(|o| o.id == order_id)?;
        let mut order = queue.remove(pos)?;
        //prune the price level if needed
        if queue.is_empty() {
            book_side.remove(&price);
        }
        order.status = OrderStatus::Cancelled;
        self.sequence += 1;
        Some(order)
    }

    pub fn cancel(&mut self, order_id: &str) -> bool {
        self.cancel_order(order_id).is_some()
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        let collect = |side| {
            self.levels(side)
                .flat_map(|(_, q)| q.iter().cloned())
                .collect::<Vec<_>>()
        };
        OrderBookSnapshot {
            pair: self.pair.clone(),
            sequence: self.sequence,
            bids: collect(Side::Buy),
            asks: collect(Side::Sell),
        }
    }

    /// Rebuilds a book from a snapshot; orders are re-queued in their listed order.
    pub fn restore(snapshot: OrderBookSnapshot, self_trade: SelfTradePolicy) -> Self {
        let mut book = OrderBook::new(snapshot.pair, self_trade);
        book.sequence = snapshot.sequence;
        for order in snapshot.bids.into_iter().chain(snapshot.asks) {
            book.index
                .insert(order.id.clone(), (order.side, order.limit_price));
            let side = match order.side {
                Side::Buy => &mut book.bids,
                Side::Sell => &mut book.asks,
            };
            side.entry(order.limit_price).or_default().push_back(order);
        }
        book
    }

    pub fn depth(&self, max_levels: usize) -> BookDepth {
        let aggregate = |side| {
            self.levels(side)
                .take(max_levels)
                .map(|(&price, q)| Level {
                    price,
                    size: q.iter().map(|o| o.remaining_size).sum(),
                    orders: q.len(),
                })
                .collect::<Vec<_>>()
        };
        BookDepth {
            pair: self.pair.clone(),
            sequence: self.sequence,
            bids: aggregate(Side::Buy),
            asks: aggregate(Side::Sell),
        }
    }
}

//tests
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::orders::OrderTimestamp;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use rust_decimal_macros::dec;
    use std::time::SystemTime;

    pub(crate) fn limit(id: &str, owner: &str, side: Side, price: Decimal, size: Decimal) -> Order {
        Order {
            id: id.to_string(),
            side,
            limit_price: price,
            original_size: size,
            remaining_size: size,
            owner: owner.to_string(),
            pair: "MBTC-MUSDT".to_string(),
            signed_payload: Vec::new(),
            created_at: OrderTimestamp {
                sequence: 0,
                wall: SystemTime::UNIX_EPOCH,
            },
            status: OrderStatus::Open,
        }
    }

    fn book() -> OrderBook {
        OrderBook::new("MBTC-MUSDT", SelfTradePolicy::Allow)
    }

    /// Sorted sides, FIFO within a level, index in sync, no empty levels.
    pub(crate) fn assert_book_invariants(ob: &OrderBook) {
        let snap = ob.snapshot();
        for w in snap.bids.windows(2) {
            assert!(w[0].limit_price >= w[1].limit_price);
            if w[0].limit_price == w[1].limit_price {
                assert!(w[0].created_at.sequence < w[1].created_at.sequence);
            }
        }
        for w in snap.asks.windows(2) {
            assert!(w[0].limit_price <= w[1].limit_price);
            if w[0].limit_price == w[1].limit_price {
                assert!(w[0].created_at.sequence < w[1].created_at.sequence);
            }
        }
        assert!(ob.bids.values().chain(ob.asks.values()).all(|q| !q.is_empty()));
        assert_eq!(ob.index.len(), snap.bids.len() + snap.asks.len());
        if let (Some(bid), Some(ask)) = (ob.best_bid(), ob.best_ask()) {
            assert!(bid < ask, "book is crossed: {bid} >= {ask}");
        }
    }

    #[test]
    fn resting_buy_then_crossing_sell_fills_at_maker_price() {
        let mut ob = book();
        let ev = ob
            .submit(limit("b1", "alice", Side::Buy, dec!(100), dec!(1.0)))
            .unwrap();
        assert_eq!(ev.outcome, MatchOutcome::NoMatch);
        assert_eq!(ev.incoming.status, OrderStatus::Open);

        let ev = ob
            .submit(limit("s1", "bob", Side::Sell, dec!(95), dec!(1.0)))
            .unwrap();
        let execs = ev.executions();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].price, dec!(100));
        assert_eq!(execs[0].quantity, dec!(1.0));
        assert_eq!(execs[0].maker.status, OrderStatus::Filled);
        assert_eq!(ev.incoming.status, OrderStatus::Filled);
        assert!(matches!(ev.outcome, MatchOutcome::Done(_)));
        assert!(ob.is_empty());
    }

    #[test]
    fn partial_fill_of_resting_order_keeps_it_open() {
        let mut ob = book();
        ob.submit(limit("b1", "alice", Side::Buy, dec!(100), dec!(2.0)))
            .unwrap();
        let ev = ob
            .submit(limit("s1", "bob", Side::Sell, dec!(100), dec!(1.0)))
            .unwrap();
        match &ev.outcome {
            MatchOutcome::Partial {
                done,
                partial: Partial::Resting(exec),
            } => {
                assert!(done.is_empty());
                assert_eq!(exec.quantity, dec!(1.0));
                assert_eq!(exec.maker.remaining_size, dec!(1.0));
                assert_eq!(exec.maker.status, OrderStatus::Open);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let resting = ob.get("b1").unwrap();
        assert_eq!(resting.remaining_size, dec!(1.0));
        assert_eq!(resting.status, OrderStatus::Open);
    }

    #[test]
    fn incoming_sweeps_levels_and_rests_remainder() {
        let mut ob = book();
        ob.submit(limit("s1", "m1", Side::Sell, dec!(101), dec!(5)))
            .unwrap();
        ob.submit(limit("s2", "m2", Side::Sell, dec!(102), dec!(3)))
            .unwrap();
        let ev = ob
            .submit(limit("b1", "t", Side::Buy, dec!(102), dec!(10)))
            .unwrap();

        let execs = ev.executions();
        assert_eq!(execs.len(), 2);
        assert_eq!((execs[0].price, execs[0].quantity), (dec!(101), dec!(5)));
        assert_eq!((execs[1].price, execs[1].quantity), (dec!(102), dec!(3)));
        assert_eq!(
            ev.outcome,
            MatchOutcome::Partial {
                done: execs.into_iter().cloned().collect(),
                partial: Partial::Incoming {
                    quantity_processed: dec!(8)
                },
            }
        );
        assert_eq!(ob.best_bid(), Some(dec!(102)));
        assert_eq!(ob.get("b1").unwrap().remaining_size, dec!(2));
        assert!(ob.best_ask().is_none());
    }

    #[test]
    fn limit_order_no_match_goes_to_book() {
        let mut ob = book();
        ob.submit(limit("s1", "m", Side::Sell, dec!(105), dec!(1)))
            .unwrap();
        let ev = ob
            .submit(limit("b1", "t", Side::Buy, dec!(90), dec!(8)))
            .unwrap();
        assert_eq!(ev.outcome, MatchOutcome::NoMatch);
        assert_eq!(ob.best_bid(), Some(dec!(90)));
        assert_eq!(ob.len(), 2);
    }

    /// Tests that FIFO order is respected for multiple orders at the same price.
    #[test]
    fn queue_fairness_fifo_fill_order() {
        let mut ob = book();
        ob.submit(limit("s1", "m1", Side::Sell, dec!(100), dec!(4)))
            .unwrap();
        ob.submit(limit("s2", "m2", Side::Sell, dec!(100), dec!(6)))
            .unwrap();
        let ev = ob
            .submit(limit("b1", "t", Side::Buy, dec!(100), dec!(9)))
            .unwrap();
        let execs = ev.executions();
        assert_eq!(execs[0].maker.id, "s1");
        assert_eq!(execs[0].quantity, dec!(4));
        assert_eq!(execs[1].maker.id, "s2");
        assert_eq!(execs[1].quantity, dec!(5));
        assert_eq!(ob.get("s2").unwrap().remaining_size, dec!(1));
    }

    #[test]
    fn better_price_beats_earlier_time() {
        let mut ob = book();
        ob.submit(limit("b1", "m1", Side::Buy, dec!(99), dec!(1)))
            .unwrap();
        ob.submit(limit("b2", "m2", Side::Buy, dec!(100), dec!(1)))
            .unwrap();
        let ev = ob
            .submit(limit("s1", "t", Side::Sell, dec!(99), dec!(1)))
            .unwrap();
        assert_eq!(ev.executions()[0].maker.id, "b2");
        assert_eq!(ev.executions()[0].price, dec!(100));
    }

    #[test]
    fn invalid_orders_do_not_touch_the_book() {
        let mut ob = book();
        ob.submit(limit("s1", "m", Side::Sell, dec!(100), dec!(1)))
            .unwrap();
        let before = ob.snapshot();

        let err = ob
            .submit(limit("b1", "t", Side::Buy, dec!(100), dec!(0)))
            .unwrap_err();
        assert_eq!(err, ValidationError::NonPositiveSize);
        let err = ob
            .submit(limit("b1", "t", Side::Buy, dec!(-1), dec!(1)))
            .unwrap_err();
        assert_eq!(err, ValidationError::NonPositivePrice);
        let err = ob
            .submit(limit("s1", "t", Side::Buy, dec!(100), dec!(1)))
            .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateOrderId("s1".into()));
        let mut other_pair = limit("b2", "t", Side::Buy, dec!(100), dec!(1));
        other_pair.pair = "ETH-USD".into();
        assert!(matches!(
            ob.submit(other_pair).unwrap_err(),
            ValidationError::PairMismatch { .. }
        ));

        assert_eq!(ob.snapshot(), before);
    }

    #[test]
    fn cancel_existing_and_nonexistent() {
        let mut ob = book();
        ob.submit(limit("b1", "m", Side::Buy, dec!(101), dec!(10)))
            .unwrap();
        let seq = ob.sequence();
        assert!(!ob.cancel("nope"));
        assert_eq!(ob.sequence(), seq);

        let cancelled = ob.cancel_order("b1").unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(ob.sequence(), seq + 1);
        assert!(ob.best_bid().is_none());
        assert!(ob.bids.is_empty());
    }

    #[test]
    fn self_trade_allowed_by_default() {
        let mut ob = book();
        ob.submit(limit("s1", "same", Side::Sell, dec!(100), dec!(1)))
            .unwrap();
        let ev = ob
            .submit(limit("b1", "same", Side::Buy, dec!(100), dec!(1)))
            .unwrap();
        assert_eq!(ev.executions().len(), 1);
    }

    #[test]
    fn self_trade_reject_leaves_book_untouched() {
        let mut ob = OrderBook::new("MBTC-MUSDT", SelfTradePolicy::Reject);
        ob.submit(limit("s1", "other", Side::Sell, dec!(99), dec!(1)))
            .unwrap();
        ob.submit(limit("s2", "same", Side::Sell, dec!(100), dec!(1)))
            .unwrap();
        let before = ob.snapshot();
        let err = ob
            .submit(limit("b1", "same", Side::Buy, dec!(100), dec!(2)))
            .unwrap_err();
        assert!(matches!(err, ValidationError::SelfTrade { ref resting_id, .. } if resting_id == "s2"));
        assert_eq!(ob.snapshot(), before);

        // does not reach the own order, so it is fine
        let ev = ob
            .submit(limit("b2", "same", Side::Buy, dec!(100), dec!(1)))
            .unwrap();
        assert_eq!(ev.executions()[0].maker.id, "s1");
    }

    #[test]
    fn self_trade_cancel_both_keeps_prior_fills() {
        let mut ob = OrderBook::new("MBTC-MUSDT", SelfTradePolicy::CancelBoth);
        ob.submit(limit("s1", "other", Side::Sell, dec!(99), dec!(1)))
            .unwrap();
        ob.submit(limit("s2", "same", Side::Sell, dec!(100), dec!(1)))
            .unwrap();
        let ev = ob
            .submit(limit("b1", "same", Side::Buy, dec!(100), dec!(3)))
            .unwrap();
        assert_eq!(ev.executions().len(), 1);
        assert_eq!(ev.cancelled.len(), 1);
        assert_eq!(ev.cancelled[0].id, "s2");
        assert_eq!(ev.incoming.status, OrderStatus::Cancelled);
        assert_eq!(ev.incoming.remaining_size, dec!(2));
        assert!(matches!(
            ev.outcome,
            MatchOutcome::Partial {
                partial: Partial::IncomingCancelled { quantity_processed },
                ..
            } if quantity_processed == dec!(1)
        ));
        assert!(ob.is_empty());
    }

    #[test]
    fn self_trade_cancel_both_without_fills_is_no_match() {
        let mut ob = OrderBook::new("MBTC-MUSDT", SelfTradePolicy::CancelBoth);
        ob.submit(limit("s1", "same", Side::Sell, dec!(100), dec!(1)))
            .unwrap();
        let ev = ob
            .submit(limit("b1", "same", Side::Buy, dec!(100), dec!(1)))
            .unwrap();
        assert_eq!(ev.outcome, MatchOutcome::NoMatch);
        assert_eq!(ev.incoming.status, OrderStatus::Cancelled);
        assert_eq!(ev.cancelled[0].id, "s1");
        assert!(ob.is_empty());
    }

    #[test]
    fn snapshot_restore_round_trip_preserves_priority() {
        let mut ob = book();
        ob.submit(limit("b1", "a", Side::Buy, dec!(100), dec!(1)))
            .unwrap();
        ob.submit(limit("b2", "b", Side::Buy, dec!(100), dec!(2)))
            .unwrap();
        ob.submit(limit("s1", "c", Side::Sell, dec!(103), dec!(2)))
            .unwrap();
        let snap = ob.snapshot();
        let mut restored = OrderBook::restore(snap.clone(), SelfTradePolicy::Allow);
        assert_eq!(restored.snapshot(), snap);

        let ev = restored
            .submit(limit("s2", "d", Side::Sell, dec!(100), dec!(1)))
            .unwrap();
        assert_eq!(ev.executions()[0].maker.id, "b1");
        assert_eq!(ev.sequence, snap.sequence + 1);
    }

    #[test]
    fn random_flow_keeps_invariants_and_conserves_size() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut ob = book();
        for i in 0..2_000 {
            if i % 7 == 3 {
                let victim = format!("o{}", rng.random_range(0..i));
                ob.cancel(&victim);
                assert_book_invariants(&ob);
                continue;
            }
            let side = if rng.random_bool(0.5) { Side::Buy } else { Side::Sell };
            let price = Decimal::from(rng.random_range(95..=105u32));
            let size = Decimal::new(rng.random_range(1..=50i64), 1);
            let id = format!("o{i}");
            let resting_before: HashMap<String, Decimal> = ob
                .snapshot()
                .bids
                .into_iter()
                .chain(ob.snapshot().asks)
                .map(|o| (o.id, o.remaining_size))
                .collect();

            let ev = ob
                .submit(limit(&id, &format!("u{}", i % 5), side, price, size))
                .unwrap();

            let consumed = ev.incoming.original_size - ev.incoming.remaining_size;
            assert_eq!(ev.filled_quantity(), consumed);
            for exec in ev.executions() {
                let before = resting_before[&exec.maker.id];
                assert_eq!(before - exec.maker.remaining_size, exec.quantity);
                assert!(crosses(side, price, exec.price));
            }
            assert_book_invariants(&ob);
        }
    }
}
