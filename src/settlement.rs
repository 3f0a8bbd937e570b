//! Turns recorded trades into fills on the external ledger.
//!
//! Every attempt starts with a conditional `pending|failed -> settling` update
//! of the stored trade. Only the caller that wins that update talks to the
//! ledger, so a trade never has two attempts in flight.

use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    errors::SettlementError,
    instrument::{PairRegistry, PairSpec},
    ledger::{LedgerGateway, SignedOrder},
    orders::Side,
    store::{Store, StoreResult},
    trade::{SettlementStatus, Trade},
};

/// What one `reconcile` call ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Settled { ledger_reference: String },
    Failed { error: SettlementError },
    /// Another attempt owns the trade, or it is in no state to be attempted.
    Skipped { status: SettlementStatus },
}

/// A fill ready to be sent: which signed order, by whom, for how much.
#[derive(Debug, Clone, PartialEq)]
pub struct FillPlan {
    pub target: SignedOrder,
    pub caller: String,
    pub amount: u128,
}

/// Aggregate settlement counts for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettlementStats {
    pub pending: usize,
    pub settling: usize,
    pub settled: usize,
    pub failed: usize,
    /// Failed trades the retry sweep will no longer pick up.
    pub exhausted: usize,
    pub total: usize,
}

pub struct SettlementReconciler {
    store: Arc<Store>,
    gateway: Arc<dyn LedgerGateway>,
    pairs: Arc<PairRegistry>,
    submitter: Option<String>,
    call_timeout: Duration,
    max_retries: u32,
}

impl SettlementReconciler {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn LedgerGateway>,
        pairs: Arc<PairRegistry>,
        submitter: Option<String>,
        call_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            gateway,
            pairs,
            submitter,
            call_timeout,
            max_retries,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn LedgerGateway> {
        &self.gateway
    }

    pub fn submitter(&self) -> Option<&str> {
        self.submitter.as_deref()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a failed trade has used up its automatic retries.
    pub fn is_exhausted(&self, trade: &Trade) -> bool {
        is_exhausted(trade, self.max_retries)
    }

    /// Runs one settlement attempt for `trade`.
    ///
    /// `trade` is the caller's view: the attempt proceeds only if the stored
    /// trade still has the same status and retry count. Claiming a `failed`
    /// trade counts as a retry.
    pub async fn reconcile(
        &self,
        trade: &Trade,
        maker_payload: &[u8],
        taker_payload: &[u8],
    ) -> SettlementOutcome {
        let claimed = match self.claim(trade) {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                let status = self
                    .store
                    .get_trade(&trade.id)
                    .ok()
                    .flatten()
                    .map_or(trade.settlement_status, |t| t.settlement_status);
                debug!(trade_id = %trade.id, status = status.as_str(), "trade not claimable, skipping");
                return SettlementOutcome::Skipped { status };
            }
            Err(e) => {
                error!(trade_id = %trade.id, error = %e, "claiming trade failed");
                return SettlementOutcome::Failed {
                    error: SettlementError::Persistence(e.to_string()),
                };
            }
        };
        info!(
            trade_id = %claimed.id,
            retry = claimed.retry_count,
            "settlement attempt started"
        );

        let result = match self.plan_fill(&claimed, maker_payload, taker_payload) {
            Ok(plan) => self.submit(&claimed, &plan).await,
            Err(e) => Err(e),
        };
        self.finish(&claimed, result)
    }

    /// Loads the trade and both orders' payloads, then reconciles.
    pub async fn reconcile_by_id(&self, trade_id: &str) -> SettlementOutcome {
        match self.store.get_trade(trade_id) {
            Ok(Some(trade)) => self.reconcile_trade(&trade).await,
            Ok(None) => {
                warn!(trade_id, "trade not found, skipping settlement");
                SettlementOutcome::Failed {
                    error: SettlementError::Persistence(format!("trade `{trade_id}` not found")),
                }
            }
            Err(e) => SettlementOutcome::Failed {
                error: SettlementError::Persistence(e.to_string()),
            },
        }
    }

    /// Reconciles `trade` as the caller last saw it, with payloads from the stored orders.
    pub async fn reconcile_trade(&self, trade: &Trade) -> SettlementOutcome {
        let payloads = (|| -> StoreResult<_> {
            let maker = self.store.get_order(&trade.maker_order_id)?;
            let taker = self.store.get_order(&trade.taker_order_id)?;
            Ok(maker.zip(taker))
        })();
        match payloads {
            Ok(Some((maker, taker))) => {
                self.reconcile(trade, &maker.signed_payload, &taker.signed_payload)
                    .await
            }
            Ok(None) => {
                warn!(trade_id = %trade.id, "orders of trade not found, skipping settlement");
                SettlementOutcome::Failed {
                    error: SettlementError::Persistence(format!(
                        "orders of trade `{}` not found",
                        trade.id
                    )),
                }
            }
            Err(e) => SettlementOutcome::Failed {
                error: SettlementError::Persistence(e.to_string()),
            },
        }
    }

    /// Works out the fill for `trade`.
    ///
    /// The resting (maker-side) order is always the one filled. The caller is
    /// the configured submitter, or else the taker's own signing address, and
    /// it may never be the embedded maker of the order it fills.
    pub fn plan_fill(
        &self,
        trade: &Trade,
        maker_payload: &[u8],
        taker_payload: &[u8],
    ) -> Result<FillPlan, SettlementError> {
        let target = SignedOrder::decode(maker_payload)?;
        let caller = match &self.submitter {
            Some(submitter) => submitter.clone(),
            None => SignedOrder::decode(taker_payload)?.maker().to_string(),
        };
        if caller.eq_ignore_ascii_case(target.maker()) {
            return Err(SettlementError::SelfFill { address: caller });
        }
        let spec = self
            .pairs
            .get(&trade.pair)
            .ok_or_else(|| SettlementError::MissingAssetMetadata(trade.pair.clone()))?;
        let amount = ledger_amount(trade, spec)?;
        Ok(FillPlan {
            target,
            caller,
            amount,
        })
    }

    fn claim(&self, trade: &Trade) -> StoreResult<Option<Trade>> {
        let (expected, seen_retries) = (trade.settlement_status, trade.retry_count);
        let max_retries = self.max_retries;
        self.store.update_trade(&trade.id, |current| {
            if current.settlement_status != expected
                || current.retry_count != seen_retries
                || !current
                    .settlement_status
                    .can_transition_to(SettlementStatus::Settling)
            {
                return None;
            }
            let mut next = current.clone();
            if current.settlement_status == SettlementStatus::Failed {
                if !current.retryable || current.retry_count >= max_retries {
                    return None;
                }
                next.retry_count += 1;
            }
            next.settlement_status = SettlementStatus::Settling;
            next.settlement_error = None;
            next.last_attempt_at = Some(SystemTime::now());
            Some(next)
        })
    }

    async fn submit(&self, trade: &Trade, plan: &FillPlan) -> Result<String, SettlementError> {
        debug!(
            trade_id = %trade.id,
            caller = %plan.caller,
            maker = %plan.target.maker(),
            amount = %plan.amount,
            "submitting fill"
        );
        let call = self.gateway.submit_fill(&plan.target, plan.amount);
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::Network(format!(
                "ledger call timed out after {:?}",
                self.call_timeout
            ))),
        };
        if let Err(SettlementError::Revert { reason, .. }) = &result {
            let id = plan.target.identifier();
            match self.gateway.query_remaining(id).await {
                Ok(remaining) => {
                    warn!(trade_id = %trade.id, order = id, remaining = %remaining, reason = %reason, "fill reverted")
                }
                Err(e) => {
                    warn!(trade_id = %trade.id, order = id, error = %e, "fill reverted, remaining unknown")
                }
            }
        }
        result
    }

    fn finish(&self, trade: &Trade, result: Result<String, SettlementError>) -> SettlementOutcome {
        let now = SystemTime::now();
        let target = if result.is_ok() {
            SettlementStatus::Settled
        } else {
            SettlementStatus::Failed
        };
        let update = self.store.update_trade(&trade.id, |current| {
            if !current.settlement_status.can_transition_to(target) {
                return None;
            }
            let mut next = current.clone();
            match &result {
                Ok(reference) => {
                    next.settlement_status = target;
                    next.ledger_tx_reference = Some(reference.clone());
                    next.settled_at = Some(now);
                    next.settlement_error = None;
                }
                Err(e) => {
                    next.settlement_status = target;
                    next.settlement_error = Some(e.to_string());
                    next.retryable = e.is_retryable();
                }
            }
            Some(next)
        });
        if let Err(e) = update {
            // the trade stays `settling`; startup recovery hands it to the retry sweep
            error!(trade_id = %trade.id, error = %e, "recording settlement result failed");
            return SettlementOutcome::Failed {
                error: SettlementError::Persistence(e.to_string()),
            };
        }
        match result {
            Ok(ledger_reference) => {
                info!(trade_id = %trade.id, tx = %ledger_reference, "trade settled");
                SettlementOutcome::Settled { ledger_reference }
            }
            Err(error) => {
                warn!(
                    trade_id = %trade.id,
                    retryable = error.is_retryable(),
                    error = %error,
                    "settlement failed"
                );
                SettlementOutcome::Failed { error }
            }
        }
    }

    /// Startup pass: attempts interrupted mid-flight become retryable failures,
    /// and the ids of trades still `pending` are returned for dispatch.
    pub fn recover_in_flight(&self) -> StoreResult<Vec<String>> {
        let mut pending = Vec::new();
        for trade in self.store.trades()? {
            match trade.settlement_status {
                SettlementStatus::Pending => pending.push(trade.id),
                SettlementStatus::Settling => {
                    self.store.update_trade(&trade.id, |current| {
                        current
                            .settlement_status
                            .can_transition_to(SettlementStatus::Failed)
                            .then(|| {
                                let mut next = current.clone();
                                next.settlement_status = SettlementStatus::Failed;
                                next.settlement_error = Some("interrupted".to_string());
                                next.retryable = true;
                                next
                            })
                    })?;
                    warn!(trade_id = %trade.id, "settlement attempt was interrupted, handing to retry sweep");
                }
                _ => {}
            }
        }
        Ok(pending)
    }

    pub fn stats(&self) -> StoreResult<SettlementStats> {
        collect_stats(&self.store, self.max_retries)
    }
}

fn is_exhausted(trade: &Trade, max_retries: u32) -> bool {
    trade.settlement_status == SettlementStatus::Failed
        && (!trade.retryable || trade.retry_count >= max_retries)
}

/// Counts stored trades per settlement status.
pub fn collect_stats(store: &Store, max_retries: u32) -> StoreResult<SettlementStats> {
    let mut stats = SettlementStats::default();
    for trade in store.trades()? {
        stats.total += 1;
        match trade.settlement_status {
            SettlementStatus::Pending => stats.pending += 1,
            SettlementStatus::Settling => stats.settling += 1,
            SettlementStatus::Settled => stats.settled += 1,
            SettlementStatus::Failed => {
                stats.failed += 1;
                if is_exhausted(&trade, max_retries) {
                    stats.exhausted += 1;
                }
            }
        }
    }
    Ok(stats)
}

/// Fill amount in the maker's taking asset, in smallest units.
///
/// A selling maker takes quote (`amount * price`), a buying maker takes base
/// (`amount`). Fractions below one unit are truncated.
pub fn ledger_amount(trade: &Trade, spec: &PairSpec) -> Result<u128, SettlementError> {
    let (value, decimals) = match trade.side {
        Side::Sell => (
            trade.amount.checked_mul(trade.price).ok_or_else(|| {
                SettlementError::AmountOutOfRange(format!("{} x {}", trade.amount, trade.price))
            })?,
            spec.quote_decimals,
        ),
        Side::Buy => (trade.amount, spec.base_decimals),
    };
    let decimals =
        decimals.ok_or_else(|| SettlementError::MissingAssetMetadata(spec.id.clone()))?;
    let mut scaled = value;
    for _ in 0..decimals {
        scaled = scaled
            .checked_mul(Decimal::TEN)
            .ok_or_else(|| SettlementError::AmountOutOfRange(format!("{value} at {decimals} decimals")))?;
    }
    match scaled.trunc().to_u128() {
        Some(units) if units > 0 => Ok(units),
        _ => Err(SettlementError::AmountOutOfRange(format!(
            "{value} at {decimals} decimals"
        ))),
    }
}

/// Runs reconciliations off the order path on a bounded pool of tasks.
#[derive(Clone)]
pub struct SettlementDispatcher {
    tx: mpsc::UnboundedSender<String>,
}

impl SettlementDispatcher {
    /// Spawns the dispatch loop; it stops taking work once `token` is cancelled.
    pub fn spawn(
        reconciler: Arc<SettlementReconciler>,
        workers: usize,
        token: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let slots = Arc::new(Semaphore::new(workers.max(1)));
        tokio::spawn(async move {
            loop {
                let trade_id = tokio::select! {
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(id) => id,
                        None => break,
                    },
                };
                let Ok(permit) = slots.clone().acquire_owned().await else {
                    break;
                };
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    reconciler.reconcile_by_id(&trade_id).await;
                });
            }
            debug!("settlement dispatcher stopped");
        });
        Self { tx }
    }

    /// Queues a trade for settlement. Never blocks.
    pub fn dispatch(&self, trade_id: impl Into<String>) {
        let trade_id = trade_id.into();
        if self.tx.send(trade_id.clone()).is_err() {
            warn!(trade_id = %trade_id, "settlement dispatcher is gone, trade stays pending");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::{SimulatedLedger, tests::payload};
    use crate::store::WriteBatch;
    use rust_decimal_macros::dec;
    use tempfile::{TempDir, tempdir};

    pub(crate) const MAKER: &str = "0x00000000000000000000000000000000000000a1";
    pub(crate) const TAKER: &str = "0x00000000000000000000000000000000000000b2";

    pub(crate) fn pairs() -> Arc<PairRegistry> {
        Arc::new(PairRegistry::new([PairSpec::new("MBTC", "MUSDT", 8, 6)]))
    }

    pub(crate) fn pending_trade(id: &str, side: Side) -> Trade {
        Trade {
            id: id.into(),
            pair: "MBTC-MUSDT".into(),
            price: dec!(100),
            amount: dec!(1.5),
            side,
            maker_order_id: format!("{id}-m"),
            taker_order_id: format!("{id}-t"),
            maker_identity: MAKER.into(),
            taker_identity: TAKER.into(),
            sequence: 1,
            created_at: SystemTime::UNIX_EPOCH,
            settlement_status: SettlementStatus::Pending,
            settlement_error: None,
            retryable: true,
            retry_count: 0,
            last_attempt_at: None,
            ledger_tx_reference: None,
            settled_at: None,
        }
    }

    /// Stores `trade` plus maker/taker orders carrying decodable payloads.
    pub(crate) fn seed(store: &Store, trade: &Trade, maker: &str, taker: &str) {
        use crate::orderbook::tests::limit;
        let mut m = limit(&trade.maker_order_id, maker, trade.side, trade.price, trade.amount);
        m.signed_payload = payload(maker, &format!("{}-salt", trade.id), 27);
        let mut t = limit(
            &trade.taker_order_id,
            taker,
            trade.side.opposite(),
            trade.price,
            trade.amount,
        );
        t.signed_payload = payload(taker, "taker-salt", 28);
        let mut batch = WriteBatch::new();
        batch.put_order(&m).unwrap();
        batch.put_order(&t).unwrap();
        batch.put_trade(trade).unwrap();
        store.commit(batch).unwrap();
    }

    pub(crate) fn reconciler(
        ledger: Arc<SimulatedLedger>,
        submitter: Option<&str>,
    ) -> (TempDir, Arc<SettlementReconciler>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let r = SettlementReconciler::new(
            store,
            ledger,
            pairs(),
            submitter.map(str::to_string),
            Duration::from_secs(5),
            3,
        );
        (dir, Arc::new(r))
    }

    #[test]
    fn amount_is_in_the_makers_taking_asset() {
        let spec = PairSpec::new("MBTC", "MUSDT", 8, 6);
        // maker sells base, takes quote: 1.5 * 100 = 150 MUSDT
        let sell = pending_trade("t", Side::Sell);
        assert_eq!(ledger_amount(&sell, &spec).unwrap(), 150_000_000);
        // maker buys base, takes base: 1.5 MBTC
        let buy = pending_trade("t", Side::Buy);
        assert_eq!(ledger_amount(&buy, &spec).unwrap(), 150_000_000);

        let mut odd = pending_trade("t", Side::Buy);
        odd.amount = dec!(0.123456789);
        assert_eq!(ledger_amount(&odd, &spec).unwrap(), 12_345_678);
    }

    #[test]
    fn missing_decimals_are_not_defaulted() {
        let spec: PairSpec = "MBTC-MUSDT".parse().unwrap();
        assert_eq!(
            ledger_amount(&pending_trade("t", Side::Sell), &spec),
            Err(SettlementError::MissingAssetMetadata("MBTC-MUSDT".into()))
        );
        let mut dust = pending_trade("t", Side::Buy);
        dust.amount = dec!(0.000000001);
        assert!(matches!(
            ledger_amount(&dust, &PairSpec::new("MBTC", "MUSDT", 8, 6)),
            Err(SettlementError::AmountOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn successful_fill_settles_the_trade() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (_dir, r) = reconciler(ledger.clone(), Some(TAKER));
        let trade = pending_trade("t1", Side::Sell);
        seed(r.store(), &trade, MAKER, TAKER);

        let outcome = r.reconcile_by_id("t1").await;
        assert!(matches!(outcome, SettlementOutcome::Settled { .. }));
        let stored = r.store().get_trade("t1").unwrap().unwrap();
        assert_eq!(stored.settlement_status, SettlementStatus::Settled);
        assert!(stored.ledger_tx_reference.is_some());
        assert!(stored.settled_at.is_some());
        assert_eq!(ledger.filled("t1-salt"), 150_000_000);

        // nothing leaves settled
        let again = r.reconcile_by_id("t1").await;
        assert_eq!(
            again,
            SettlementOutcome::Skipped {
                status: SettlementStatus::Settled
            }
        );
        assert_eq!(ledger.calls(), 1);
    }

    #[tokio::test]
    async fn caller_equal_to_embedded_maker_is_refused() {
        let ledger = Arc::new(SimulatedLedger::new());
        // addresses compare case-insensitively
        let checksummed = MAKER.to_uppercase().replace("0X", "0x");
        let (_dir, r) = reconciler(ledger.clone(), Some(checksummed.as_str()));
        let trade = pending_trade("t1", Side::Buy);
        seed(r.store(), &trade, MAKER, TAKER);

        let outcome = r.reconcile_by_id("t1").await;
        assert!(matches!(
            outcome,
            SettlementOutcome::Failed {
                error: SettlementError::SelfFill { .. }
            }
        ));
        assert_eq!(ledger.calls(), 0);
        let stored = r.store().get_trade("t1").unwrap().unwrap();
        assert_eq!(stored.settlement_status, SettlementStatus::Failed);
        assert!(!stored.retryable);
        assert!(stored.ledger_tx_reference.is_none());
        assert!(r.is_exhausted(&stored));
    }

    #[tokio::test]
    async fn taker_signing_address_is_the_default_caller() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (_dir, r) = reconciler(ledger.clone(), None);
        // same wallet on both sides of the match
        let trade = pending_trade("t1", Side::Sell);
        seed(r.store(), &trade, MAKER, MAKER);
        let outcome = r.reconcile_by_id("t1").await;
        assert!(matches!(
            outcome,
            SettlementOutcome::Failed {
                error: SettlementError::SelfFill { .. }
            }
        ));

        let other = pending_trade("t2", Side::Sell);
        seed(r.store(), &other, MAKER, TAKER);
        let plan = r
            .plan_fill(
                &other,
                &payload(MAKER, "x", 27),
                &payload(TAKER, "y", 27),
            )
            .unwrap();
        assert_eq!(plan.caller, TAKER);
        assert_eq!(plan.target.maker(), MAKER);
    }

    #[tokio::test]
    async fn network_failure_is_retryable_and_stale_callers_skip() {
        let ledger = Arc::new(SimulatedLedger::new());
        ledger.fail_next(1, SettlementError::Network("connection reset".into()));
        let (_dir, r) = reconciler(ledger.clone(), Some(TAKER));
        let trade = pending_trade("t1", Side::Sell);
        seed(r.store(), &trade, MAKER, TAKER);

        let outcome = r.reconcile(&trade, &payload(MAKER, "a", 27), &payload(TAKER, "b", 27)).await;
        assert!(matches!(outcome, SettlementOutcome::Failed { .. }));
        let failed = r.store().get_trade("t1").unwrap().unwrap();
        assert_eq!(failed.settlement_status, SettlementStatus::Failed);
        assert!(failed.retryable);
        assert_eq!(failed.retry_count, 0);

        // a caller still holding the pending view loses the compare-and-swap
        let stale = r.reconcile(&trade, &payload(MAKER, "a", 27), &payload(TAKER, "b", 27)).await;
        assert_eq!(
            stale,
            SettlementOutcome::Skipped {
                status: SettlementStatus::Failed
            }
        );
        assert_eq!(ledger.calls(), 1);

        let retried = r.reconcile(&failed, &payload(MAKER, "a", 27), &payload(TAKER, "b", 27)).await;
        assert!(matches!(retried, SettlementOutcome::Settled { .. }));
        let settled = r.store().get_trade("t1").unwrap().unwrap();
        assert_eq!(settled.retry_count, 1);
        assert_eq!(settled.settlement_error, None);
    }

    #[tokio::test]
    async fn slow_ledger_times_out_as_network_error() {
        let ledger = Arc::new(SimulatedLedger::new().with_delay(Duration::from_millis(200)));
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let r = SettlementReconciler::new(
            store.clone(),
            ledger,
            pairs(),
            Some(TAKER.into()),
            Duration::from_millis(20),
            3,
        );
        let trade = pending_trade("t1", Side::Sell);
        seed(&store, &trade, MAKER, TAKER);
        let outcome = r.reconcile_by_id("t1").await;
        match outcome {
            SettlementOutcome::Failed { error } => assert!(error.is_retryable()),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupted_attempts_are_handed_to_the_sweep() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (_dir, r) = reconciler(ledger, Some(TAKER));
        let pending = pending_trade("p", Side::Sell);
        let mut settling = pending_trade("s", Side::Sell);
        settling.settlement_status = SettlementStatus::Settling;
        seed(r.store(), &pending, MAKER, TAKER);
        seed(r.store(), &settling, MAKER, TAKER);

        let ids = r.recover_in_flight().unwrap();
        assert_eq!(ids, vec!["p".to_string()]);
        let s = r.store().get_trade("s").unwrap().unwrap();
        assert_eq!(s.settlement_status, SettlementStatus::Failed);
        assert!(s.retryable);

        let stats = r.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.exhausted, 0);
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn settled_trades_are_never_reopened() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (_dir, r) = reconciler(ledger.clone(), Some(TAKER));
        let mut settled = pending_trade("done", Side::Sell);
        settled.settlement_status = SettlementStatus::Settled;
        settled.ledger_tx_reference = Some("0xfeed".into());
        seed(r.store(), &settled, MAKER, TAKER);

        // even a caller whose view matches cannot claim it
        let outcome = r
            .reconcile(&settled, &payload(MAKER, "a", 27), &payload(TAKER, "b", 27))
            .await;
        assert_eq!(
            outcome,
            SettlementOutcome::Skipped {
                status: SettlementStatus::Settled
            }
        );
        r.finish(&settled, Err(SettlementError::Network("late".into())));
        assert!(r.recover_in_flight().unwrap().is_empty());
        assert_eq!(r.store().get_trade("done").unwrap().unwrap(), settled);
        assert_eq!(ledger.calls(), 0);

        // a pending trade cannot skip settling
        let pending = pending_trade("p", Side::Sell);
        seed(r.store(), &pending, MAKER, TAKER);
        r.finish(&pending, Ok("0xbeef".into()));
        assert_eq!(r.store().get_trade("p").unwrap().unwrap(), pending);
    }

    #[tokio::test]
    async fn dispatcher_settles_queued_trades() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (_dir, r) = reconciler(ledger.clone(), Some(TAKER));
        for id in ["a", "b", "c"] {
            seed(r.store(), &pending_trade(id, Side::Buy), MAKER, TAKER);
        }
        let token = CancellationToken::new();
        let dispatcher = SettlementDispatcher::spawn(r.clone(), 2, token.clone());
        for id in ["a", "b", "c", "a"] {
            dispatcher.dispatch(id);
        }
        for _ in 0..100 {
            if r.stats().unwrap().settled == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(r.stats().unwrap().settled, 3);
        assert_eq!(ledger.calls(), 3);
        token.cancel();
    }
}
