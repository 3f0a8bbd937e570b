use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    errors::{EngineError, PersistenceError, SettlementError, ValidationError},
    instrument::PairRegistry,
    journal::{Applied, JournalEvent, RecoveryLog},
    ledger::LedgerGateway,
    orderbook::{BookDepth, MatchEvent, OrderBook, OrderBookSnapshot, SelfTradePolicy},
    orders::{NewOrder, Order},
    recorder::TradeRecorder,
    retry::{Backoff, RetryScheduler, SweepReport},
    settlement::{SettlementDispatcher, SettlementReconciler, SettlementStats},
    store::{Store, WriteBatch},
    trade::{SettlementStatus, Trade},
};

/// Result of one accepted submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitAck {
    pub event: MatchEvent,
    pub trades: Vec<Trade>,
}

enum RecordJob {
    Matched(MatchEvent, oneshot::Sender<Result<Vec<Trade>, PersistenceError>>),
    Cancelled(u64, Order, oneshot::Sender<Result<Vec<Trade>, PersistenceError>>),
}

type Reply = oneshot::Receiver<Result<Vec<Trade>, PersistenceError>>;

/// Order ids journaled but not yet recorded, shared by all pairs.
type Inflight = Arc<StdMutex<HashSet<String>>>;

/// Single owner of one pair's book.
///
/// Submits and cancels are serialized by the book lock, which covers
/// validation, the journal append and matching, and nothing slower. Recording
/// happens on a per-pair queue in sequence order, so the next submission can
/// match while the previous one is still being persisted.
///
/// Once recording fails the engine is halted: the book has moved past what is
/// on disk, so it refuses further submits and cancels until a restart replays
/// the journal.
pub struct PairEngine {
    pair: String,
    book: Mutex<OrderBook>,
    log: RecoveryLog,
    store: Arc<Store>,
    records: mpsc::UnboundedSender<RecordJob>,
    inflight: Inflight,
    halted: Arc<AtomicBool>,
}

impl PairEngine {
    /// Rebuilds the book from the latest snapshot plus the journal, and
    /// re-records every event the recorder had not committed before the restart.
    pub async fn recover(
        pair: &str,
        store: Arc<Store>,
        snapshot_every: u64,
        policy: SelfTradePolicy,
        inflight: Inflight,
    ) -> Result<Self, EngineError> {
        let log = RecoveryLog::new(store.clone(), pair, snapshot_every);
        let recorder = TradeRecorder::new(store.clone());
        let recorded = store
            .recorded_sequence(pair)
            .map_err(PersistenceError::from)?;

        let mut book = match log.load_latest_snapshot()? {
            // trades of events folded into the snapshot were never recorded
            Some(snap) if snap.sequence > recorded => {
                warn!(pair, snapshot = snap.sequence, recorded, "recorder lags snapshot, replaying full journal");
                OrderBook::new(pair, policy)
            }
            Some(snap) => OrderBook::restore(snap, policy),
            None => OrderBook::new(pair, policy),
        };
        let from = book.sequence() + 1;
        let mut rerecorded = 0usize;
        // final state of every order the replay touched, recorded or not
        let mut replayed: HashMap<String, Order> = HashMap::new();
        for record in log.replay(from)? {
            let Some(applied) = record.apply(&mut book)? else {
                continue;
            };
            match &applied {
                Applied::Matched(event) => {
                    for order in event.touched_orders() {
                        replayed.insert(order.id.clone(), order.clone());
                    }
                }
                Applied::Cancelled { order, .. } => {
                    replayed.insert(order.id.clone(), order.clone());
                }
            }
            if record.sequence <= recorded {
                continue;
            }
            match applied {
                Applied::Matched(event) => {
                    recorder.record(&event).await?;
                }
                Applied::Cancelled { sequence, order } => {
                    recorder.record_cancel(sequence, &order).await?;
                }
            }
            rerecorded += 1;
        }

        // the replayed state is authoritative over whatever was persisted
        let mut batch = WriteBatch::new();
        let mut corrected = 0usize;
        for order in store
            .orders_for_pair(pair)
            .map_err(PersistenceError::from)?
        {
            match replayed.get(&order.id) {
                Some(latest) if *latest != order => corrected += 1,
                None if order.is_open() && !book.contains(&order.id) => {
                    // closed before the snapshot the replay started from
                    warn!(pair, order_id = %order.id, "persisted open order is not resting after recovery");
                }
                _ => {}
            }
        }
        for order in replayed.values() {
            batch.put_order(order).map_err(PersistenceError::from)?;
        }
        let snapshot = book.snapshot();
        for order in snapshot.bids.iter().chain(&snapshot.asks) {
            batch.put_order(order).map_err(PersistenceError::from)?;
        }
        store.commit(batch).map_err(PersistenceError::from)?;
        if corrected > 0 {
            warn!(pair, corrected, "persisted order states overwritten from the journal");
        }
        info!(
            pair,
            sequence = book.sequence(),
            resting = book.len(),
            replayed_from = from,
            rerecorded,
            "book recovered"
        );

        let halted = Arc::new(AtomicBool::new(false));
        Ok(Self {
            pair: pair.to_string(),
            book: Mutex::new(book),
            log,
            records: spawn_recorder(pair.to_string(), recorder, halted.clone()),
            store,
            inflight,
            halted,
        })
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    /// Validates, journals and matches `order`, then waits for its trades to be recorded.
    pub async fn submit(&self, order: Order) -> Result<SubmitAck, EngineError> {
        let order_id = order.id.clone();
        let (event, reply) = {
            let mut book = self.book.lock().await;
            self.ensure_running()?;
            book.check(&order)?;
            self.reserve_id(&order.id)?;
            let sequence = book.sequence() + 1;
            let mut stamped = order;
            stamped.created_at.sequence = sequence;
            if let Err(e) = self
                .log
                .append(sequence, &JournalEvent::Submitted(stamped.clone()))
            {
                self.release_id(&order_id);
                return Err(e.into());
            }
            let event = match book.submit(stamped) {
                Ok(event) => event,
                Err(e) => {
                    self.release_id(&order_id);
                    return Err(e.into());
                }
            };
            self.maybe_snapshot(&book);
            let (tx, rx) = oneshot::channel();
            self.enqueue(RecordJob::Matched(event.clone(), tx));
            (event, rx)
        };
        // a failed id stays reserved: it is journaled and matched but not persisted
        let trades = self.await_record(reply).await?;
        self.release_id(&order_id);
        debug!(pair = %self.pair, order_id = %order_id, sequence = event.sequence, "order acknowledged");
        Ok(SubmitAck { event, trades })
    }

    /// Cancels a resting order. Returns `false` if it is not resting.
    pub async fn cancel(&self, order_id: &str) -> Result<bool, EngineError> {
        let reply = {
            let mut book = self.book.lock().await;
            self.ensure_running()?;
            if !book.contains(order_id) {
                return Ok(false);
            }
            let sequence = book.sequence() + 1;
            self.log.append(
                sequence,
                &JournalEvent::Cancelled {
                    order_id: order_id.to_string(),
                },
            )?;
            let Some(order) = book.cancel_order(order_id) else {
                return Ok(false);
            };
            self.maybe_snapshot(&book);
            let (tx, rx) = oneshot::channel();
            self.enqueue(RecordJob::Cancelled(sequence, order, tx));
            rx
        };
        self.await_record(reply).await?;
        info!(pair = %self.pair, order_id, "order cancelled");
        Ok(true)
    }

    pub async fn snapshot(&self) -> OrderBookSnapshot {
        self.book.lock().await.snapshot()
    }

    pub async fn depth(&self, levels: usize) -> BookDepth {
        self.book.lock().await.depth(levels)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), PersistenceError> {
        if self.is_halted() {
            return Err(PersistenceError::Halted(self.pair.clone()));
        }
        Ok(())
    }

    fn reserve_id(&self, id: &str) -> Result<(), EngineError> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.contains(id)
            || self
                .store
                .order_exists(id)
                .map_err(PersistenceError::from)?
        {
            return Err(ValidationError::DuplicateOrderId(id.to_string()).into());
        }
        inflight.insert(id.to_string());
        Ok(())
    }

    fn release_id(&self, id: &str) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn maybe_snapshot(&self, book: &OrderBook) {
        if !self.log.snapshot_due(book.sequence()) {
            return;
        }
        if let Err(e) = self.log.save_snapshot(&book.snapshot()) {
            warn!(pair = %self.pair, sequence = book.sequence(), error = %e, "snapshot failed, journal still covers it");
        }
    }

    fn enqueue(&self, job: RecordJob) {
        if self.records.send(job).is_err() {
            warn!(pair = %self.pair, "trade recorder is gone");
        }
    }

    async fn await_record(&self, reply: Reply) -> Result<Vec<Trade>, PersistenceError> {
        reply
            .await
            .map_err(|_| PersistenceError::RecorderStopped(self.pair.clone()))?
    }
}

/// Records jobs strictly in the order they were queued.
///
/// After the first failure nothing else is recorded: later jobs are answered
/// with [`PersistenceError::Halted`] and the watermark stays below the failed
/// sequence, so a restart re-records all of them from the journal.
fn spawn_recorder(
    pair: String,
    recorder: TradeRecorder,
    halted: Arc<AtomicBool>,
) -> mpsc::UnboundedSender<RecordJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<RecordJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let (sequence, result, reply) = match job {
                RecordJob::Matched(_, reply) | RecordJob::Cancelled(_, _, reply)
                    if halted.load(Ordering::Acquire) =>
                {
                    let _ = reply.send(Err(PersistenceError::Halted(pair.clone())));
                    continue;
                }
                RecordJob::Matched(event, reply) => {
                    (event.sequence, recorder.record(&event).await, reply)
                }
                RecordJob::Cancelled(sequence, order, reply) => {
                    let result = recorder.record_cancel(sequence, &order).await;
                    (sequence, result.map(|()| Vec::new()), reply)
                }
            };
            if let Err(e) = &result {
                halted.store(true, Ordering::Release);
                error!(pair = %pair, sequence, error = %e, "recording failed, pair halted until restart");
            }
            let _ = reply.send(result);
        }
        debug!(pair = %pair, "trade recorder stopped");
    });
    tx
}

struct Inner {
    config: Config,
    store: Arc<Store>,
    engines: HashMap<String, PairEngine>,
    reconciler: Arc<SettlementReconciler>,
    dispatcher: Option<SettlementDispatcher>,
    scheduler: Arc<RetryScheduler>,
    token: CancellationToken,
}

/// Shared application state: one engine per configured pair plus the settlement side.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    /// Opens the database at `path`, recovers every pair and resumes settlement.
    pub async fn new(
        path: impl AsRef<Path>,
        config: Config,
        gateway: Arc<dyn LedgerGateway>,
        token: CancellationToken,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(Store::open(path).map_err(PersistenceError::from)?);
        let pairs: Arc<PairRegistry> = Arc::new(config.registry());
        let inflight: Inflight = Arc::default();

        let mut engines = HashMap::new();
        for spec in &config.pairs {
            let engine = PairEngine::recover(
                spec.code(),
                store.clone(),
                config.snapshot_every,
                config.self_trade,
                inflight.clone(),
            )
            .await?;
            engines.insert(spec.id.clone(), engine);
        }

        let s = &config.settlement;
        let reconciler = Arc::new(SettlementReconciler::new(
            store.clone(),
            gateway,
            pairs,
            s.submitter.clone(),
            s.call_timeout(),
            s.max_retries,
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            reconciler.clone(),
            Backoff::new(s.retry_base(), s.retry_max()),
            s.sweep_batch,
        ));
        let dispatcher = if s.enabled {
            let dispatcher =
                SettlementDispatcher::spawn(reconciler.clone(), s.workers, token.clone());
            let pending = reconciler
                .recover_in_flight()
                .map_err(PersistenceError::from)?;
            if !pending.is_empty() {
                info!(trades = pending.len(), "resuming pending settlements");
            }
            for id in pending {
                dispatcher.dispatch(id);
            }
            Some(dispatcher)
        } else {
            warn!("settlement is disabled, trades stay pending");
            None
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                engines,
                reconciler,
                dispatcher,
                scheduler,
                token,
            }),
        })
    }

    /// Starts the periodic retry sweep. No-op when settlement is disabled.
    pub fn spawn_retry_scheduler(&self) {
        if self.inner.dispatcher.is_none() {
            return;
        }
        let interval = self
            .inner
            .config
            .settlement
            .sweep_interval()
            .max(Duration::from_millis(10));
        let scheduler = self.inner.scheduler.clone();
        tokio::spawn(scheduler.run(interval, self.inner.token.clone()));
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn engine(&self, pair: &str) -> Result<&PairEngine, EngineError> {
        self.inner
            .engines
            .get(pair)
            .ok_or_else(|| EngineError::UnknownPair(pair.to_string()))
    }

    /// Accepts an order; its trades are queued for settlement, never awaited.
    pub async fn submit_order(&self, new_order: NewOrder) -> Result<SubmitAck, EngineError> {
        let engine = self.engine(&new_order.pair)?;
        let order = new_order.into_order()?;
        let ack = engine.submit(order).await?;
        if let Some(dispatcher) = &self.inner.dispatcher {
            for trade in &ack.trades {
                if trade.settlement_status == SettlementStatus::Pending {
                    dispatcher.dispatch(trade.id.clone());
                }
            }
        }
        Ok(ack)
    }

    pub async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<bool, EngineError> {
        self.engine(pair)?.cancel(order_id).await
    }

    pub async fn depth(&self, pair: &str, levels: usize) -> Result<BookDepth, EngineError> {
        Ok(self.engine(pair)?.depth(levels).await)
    }

    pub fn settlement_stats(&self) -> Result<SettlementStats, EngineError> {
        Ok(self
            .inner
            .reconciler
            .stats()
            .map_err(PersistenceError::from)?)
    }

    /// Runs a retry sweep now, ignoring backoff timers.
    pub async fn retry_failed(&self) -> Result<SweepReport, EngineError> {
        if self.inner.dispatcher.is_none() {
            return Ok(SweepReport::default());
        }
        Ok(self
            .inner
            .scheduler
            .sweep_now()
            .await
            .map_err(PersistenceError::from)?)
    }

    /// Submitter address and its ledger balance, if a submitter is configured.
    pub async fn bot_balance(&self) -> Result<Option<(String, u128)>, SettlementError> {
        let Some(address) = self.inner.reconciler.submitter() else {
            return Ok(None);
        };
        let balance = self.inner.reconciler.gateway().balance_of(address).await?;
        if balance == 0 {
            warn!(address, "settlement submitter has no balance");
        }
        Ok(Some((address.to_string(), balance)))
    }
}
