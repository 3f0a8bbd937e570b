use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    errors::PersistenceError,
    orderbook::MatchEvent,
    orders::Order,
    store::{Store, StoreError, WriteBatch},
    trade::{SettlementStatus, Trade},
};

const DEFAULT_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Turns match events into durable trades and order updates.
///
/// Everything one event produces (trades, touched orders, the recorded
/// watermark) goes into a single atomic batch. Trades already on disk are
/// never overwritten, so recording the same event twice is harmless and
/// keeps any settlement progress.
#[derive(Clone)]
pub struct TradeRecorder {
    store: Arc<Store>,
    attempts: u32,
    retry_delay: Duration,
}

impl TradeRecorder {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// One trade per execution, in match order, all `pending`.
    pub fn trades_for(event: &MatchEvent) -> Vec<Trade> {
        let taker = &event.incoming;
        event
            .executions()
            .into_iter()
            .enumerate()
            .map(|(idx, exec)| Trade {
                id: Trade::make_id(&taker.pair, event.sequence, idx),
                pair: taker.pair.clone(),
                price: exec.price,
                amount: exec.quantity,
                side: exec.maker.side,
                maker_order_id: exec.maker.id.clone(),
                taker_order_id: taker.id.clone(),
                maker_identity: exec.maker.owner.clone(),
                taker_identity: taker.owner.clone(),
                sequence: event.sequence,
                // the submission's wall time keeps replayed trades identical
                created_at: taker.created_at.wall,
                settlement_status: SettlementStatus::Pending,
                settlement_error: None,
                retryable: true,
                retry_count: 0,
                last_attempt_at: None,
                ledger_tx_reference: None,
                settled_at: None,
            })
            .collect()
    }

    /// Persists the trades and order updates of `event`.
    ///
    /// Returns the trades as stored, which for a re-recorded event may already
    /// carry settlement progress.
    pub async fn record(&self, event: &MatchEvent) -> Result<Vec<Trade>, PersistenceError> {
        let recorded = self.next_in_line(&event.incoming.pair, event.sequence)?;
        let trades = self
            .with_retries(event.sequence, || self.commit_event(event, recorded))
            .await?;
        if !trades.is_empty() {
            info!(
                pair = %event.incoming.pair,
                sequence = event.sequence,
                trades = trades.len(),
                "trades recorded"
            );
        }
        Ok(trades)
    }

    /// Persists a cancelled order and advances the watermark.
    pub async fn record_cancel(&self, sequence: u64, order: &Order) -> Result<(), PersistenceError> {
        let recorded = self.next_in_line(&order.pair, sequence)?;
        self.with_retries(sequence, || {
            let mut batch = WriteBatch::new();
            batch.put_order(order)?;
            batch.put_recorded(&order.pair, sequence.max(recorded));
            self.store.commit(batch)
        })
        .await?;
        debug!(pair = %order.pair, order_id = %order.id, sequence, "cancel recorded");
        Ok(())
    }

    /// The watermark only moves one sequence at a time, so a skipped event can
    /// never end up below it. Returns the current watermark.
    fn next_in_line(&self, pair: &str, sequence: u64) -> Result<u64, PersistenceError> {
        let recorded = self.store.recorded_sequence(pair)?;
        if sequence > recorded + 1 {
            return Err(PersistenceError::OutOfOrder {
                pair: pair.to_string(),
                recorded,
                found: sequence,
            });
        }
        Ok(recorded)
    }

    fn commit_event(&self, event: &MatchEvent, recorded: u64) -> Result<Vec<Trade>, StoreError> {
        let mut batch = WriteBatch::new();
        let mut stored = Vec::new();
        for trade in Self::trades_for(event) {
            match self.store.get_trade(&trade.id)? {
                Some(existing) => stored.push(existing),
                None => {
                    batch.put_trade(&trade)?;
                    stored.push(trade);
                }
            }
        }
        for order in event.touched_orders() {
            batch.put_order(order)?;
        }
        batch.put_recorded(&event.incoming.pair, event.sequence.max(recorded));
        self.store.commit(batch)?;
        Ok(stored)
    }

    async fn with_retries<T, F>(&self, sequence: u64, mut op: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(source) if attempt >= self.attempts => {
                    return Err(PersistenceError::Exhausted {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(sequence, attempt, error = %e, "persisting match result failed, retrying");
                    sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}
