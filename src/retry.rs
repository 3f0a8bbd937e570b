use rand::Rng;
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    settlement::{SettlementOutcome, SettlementReconciler},
    store::StoreResult,
    trade::{SettlementStatus, Trade},
};

/// Exponential backoff between settlement retries: `base * 2^retries`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Extra random delay, as a fraction of the computed delay.
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retries + 1`.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }

    /// Whether enough time has passed since the trade's last attempt.
    pub fn is_due(&self, trade: &Trade, now: SystemTime) -> bool {
        let Some(last) = trade.last_attempt_at else {
            return true;
        };
        let wait = self.jittered(self.delay(trade.retry_count));
        // a clock that went backwards counts as not yet due
        now.duration_since(last).is_ok_and(|elapsed| elapsed >= wait)
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub selected: usize,
    pub settled: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Failed trades left for an operator.
    pub exhausted: usize,
}

/// Re-drives failed settlements in the background.
pub struct RetryScheduler {
    reconciler: Arc<SettlementReconciler>,
    backoff: Backoff,
    batch: usize,
}

impl RetryScheduler {
    pub fn new(reconciler: Arc<SettlementReconciler>, backoff: Backoff, batch: usize) -> Self {
        Self {
            reconciler,
            backoff,
            batch: batch.max(1),
        }
    }

    /// Retries up to one batch of failed trades whose backoff has elapsed.
    pub async fn sweep(&self) -> StoreResult<SweepReport> {
        self.sweep_inner(false).await
    }

    /// Like [`sweep`](Self::sweep), but ignores backoff timers. For operators.
    pub async fn sweep_now(&self) -> StoreResult<SweepReport> {
        self.sweep_inner(true).await
    }

    async fn sweep_inner(&self, ignore_backoff: bool) -> StoreResult<SweepReport> {
        let now = SystemTime::now();
        let mut report = SweepReport::default();
        let mut due: Vec<Trade> = Vec::new();
        for trade in self.reconciler.store().trades()? {
            if trade.settlement_status != SettlementStatus::Failed {
                continue;
            }
            if self.reconciler.is_exhausted(&trade) {
                report.exhausted += 1;
                continue;
            }
            if ignore_backoff || self.backoff.is_due(&trade, now) {
                due.push(trade);
            }
        }
        // oldest attempts first
        due.sort_by_key(|t| t.last_attempt_at);
        due.truncate(self.batch);
        report.selected = due.len();

        for trade in &due {
            debug!(trade_id = %trade.id, retry = trade.retry_count + 1, "retrying settlement");
            match self.reconciler.reconcile_trade(trade).await {
                SettlementOutcome::Settled { .. } => report.settled += 1,
                SettlementOutcome::Failed { error } => {
                    report.failed += 1;
                    if !error.is_retryable() || trade.retry_count + 1 >= self.reconciler.max_retries() {
                        warn!(trade_id = %trade.id, error = %error, "settlement retries exhausted, left for operator");
                    }
                }
                SettlementOutcome::Skipped { .. } => report.skipped += 1,
            }
        }
        if report.selected > 0 || report.exhausted > 0 {
            info!(
                selected = report.selected,
                settled = report.settled,
                failed = report.failed,
                skipped = report.skipped,
                exhausted = report.exhausted,
                "retry sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweeps every `interval` until `token` is cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "retry sweep failed");
                    }
                }
            }
        }
        debug!("retry scheduler stopped");
    }
}
