//! Write-ahead journal of book commands plus periodic snapshots.
//!
//! The journal records **inbound** commands (submit, cancel), not their results.
//! The book is deterministic, so replaying the same commands from a snapshot
//! reproduces the same matches and the same final book.

use bincode::config;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    errors::RecoveryLogError,
    orderbook::{MatchEvent, OrderBook, OrderBookSnapshot},
    orders::Order,
    store::{Store, StoreError},
};

/// A state-changing command for one pair's book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEvent {
    /// The order as it was submitted, already stamped with its sequence.
    Submitted(Order),
    Cancelled { order_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub sequence: u64,
    pub event: JournalEvent,
}

/// What replaying one record did to the book.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Matched(MatchEvent),
    Cancelled { sequence: u64, order: Order },
}

impl JournalRecord {
    /// Applies the record to `book`.
    ///
    /// Records at or below the book's sequence were already applied and are
    /// skipped (`Ok(None)`), so duplicate delivery is harmless.
    pub fn apply(&self, book: &mut OrderBook) -> Result<Option<Applied>, RecoveryLogError> {
        if self.sequence <= book.sequence() {
            debug!(sequence = self.sequence, "skipping already applied journal entry");
            return Ok(None);
        }
        let expected = book.sequence() + 1;
        if self.sequence != expected {
            return Err(RecoveryLogError::Gap {
                expected,
                found: self.sequence,
            });
        }
        let applied = match &self.event {
            JournalEvent::Submitted(order) => {
                let event =
                    book.submit(order.clone())
                        .map_err(|e| RecoveryLogError::Replay {
                            sequence: self.sequence,
                            reason: e.to_string(),
                        })?;
                Applied::Matched(event)
            }
            JournalEvent::Cancelled { order_id } => {
                let order = book
                    .cancel_order(order_id)
                    .ok_or_else(|| RecoveryLogError::Replay {
                        sequence: self.sequence,
                        reason: format!("order `{order_id}` is not resting"),
                    })?;
                Applied::Cancelled {
                    sequence: self.sequence,
                    order,
                }
            }
        };
        Ok(Some(applied))
    }
}

/// Journal and snapshot access for one pair.
#[derive(Clone)]
pub struct RecoveryLog {
    store: Arc<Store>,
    pair: String,
    snapshot_every: u64,
}

impl RecoveryLog {
    pub fn new(store: Arc<Store>, pair: impl Into<String>, snapshot_every: u64) -> Self {
        Self {
            store,
            pair: pair.into(),
            snapshot_every: snapshot_every.max(1),
        }
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    /// Durably appends `event` at `sequence`. Appending an existing sequence is a no-op.
    pub fn append(&self, sequence: u64, event: &JournalEvent) -> Result<(), RecoveryLogError> {
        let record = JournalRecord {
            sequence,
            event: event.clone(),
        };
        let raw = bincode::serde::encode_to_vec(&record, config::standard()).map_err(|e| {
            RecoveryLogError::Write {
                sequence,
                source: StoreError::from(e),
            }
        })?;
        let written = self
            .store
            .put_journal_if_absent(&self.pair, sequence, raw)
            .map_err(|source| RecoveryLogError::Write { sequence, source })?;
        if !written {
            warn!(pair = %self.pair, sequence, "journal entry already present, ignoring append");
        }
        Ok(())
    }

    /// Whether a snapshot is due after `sequence` was applied.
    pub fn snapshot_due(&self, sequence: u64) -> bool {
        sequence % self.snapshot_every == 0
    }

    pub fn save_snapshot(&self, snapshot: &OrderBookSnapshot) -> Result<(), RecoveryLogError> {
        self.store
            .put_snapshot(snapshot)
            .map_err(|source| RecoveryLogError::Write {
                sequence: snapshot.sequence,
                source,
            })?;
        info!(pair = %self.pair, sequence = snapshot.sequence, "snapshot written");
        Ok(())
    }

    pub fn load_latest_snapshot(&self) -> Result<Option<OrderBookSnapshot>, RecoveryLogError> {
        self.store
            .latest_snapshot(&self.pair)
            .map_err(RecoveryLogError::Read)
    }

    /// All records with sequence `>= from_sequence`, in order.
    pub fn replay(&self, from_sequence: u64) -> Result<Vec<JournalRecord>, RecoveryLogError> {
        let raw = self
            .store
            .journal_from(&self.pair, from_sequence)
            .map_err(RecoveryLogError::Read)?;
        let mut records = Vec::with_capacity(raw.len());
        for (sequence, bytes) in raw {
            let (record, _): (JournalRecord, usize) =
                bincode::serde::decode_from_slice(&bytes, config::standard())
                    .map_err(|e| RecoveryLogError::Read(StoreError::from(e)))?;
            if record.sequence != sequence {
                return Err(RecoveryLogError::Replay {
                    sequence,
                    reason: format!("entry claims sequence {}", record.sequence),
                });
            }
            records.push(record);
        }
        Ok(records)
    }
}
