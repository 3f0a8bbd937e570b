use bincode::{
    config,
    error::{DecodeError, EncodeError},
};
use parity_db::{ColId, Db, Options};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};
use thiserror::Error;

use crate::{orderbook::OrderBookSnapshot, orders::Order, trade::Trade};

/// Journal entries, keyed by `pair:` + big-endian sequence.
pub const COL_JOURNAL: ColId = 0;
/// Latest book snapshot per pair, keyed by pair.
pub const COL_SNAPSHOTS: ColId = 1;
/// Orders keyed by order id.
pub const COL_ORDERS: ColId = 2;
/// Trades keyed by trade id.
pub const COL_TRADES: ColId = 3;
/// Small bookkeeping values (recorded watermarks).
pub const COL_META: ColId = 4;
const COLUMNS: u8 = 5;

/// Errors from the key/value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ParityDB error: {0}")]
    Parity(#[from] parity_db::Error),

    #[error("Bincode encode error: {0}")]
    BincodeEncode(#[from] EncodeError),

    #[error("Bincode decode error: {0}")]
    BincodeDecode(#[from] DecodeError),
}

pub type StoreResult<T> = Result<T, StoreError>;

type Op = (ColId, Vec<u8>, Option<Vec<u8>>);

/// A set of writes committed atomically by [`Store::commit`].
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<Op>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_order(&mut self, order: &Order) -> StoreResult<()> {
        self.ops
            .push((COL_ORDERS, order.id.as_bytes().to_vec(), Some(encode(order)?)));
        Ok(())
    }

    pub fn put_trade(&mut self, trade: &Trade) -> StoreResult<()> {
        self.ops
            .push((COL_TRADES, trade.id.as_bytes().to_vec(), Some(encode(trade)?)));
        Ok(())
    }

    pub fn put_recorded(&mut self, pair: &str, sequence: u64) {
        self.ops.push((
            COL_META,
            recorded_key(pair),
            Some(sequence.to_be_bytes().to_vec()),
        ));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, config::standard())?)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(raw, config::standard())?;
    Ok(value)
}

#[inline]
fn prefix(pair: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(pair.len() + 1);
    k.extend_from_slice(pair.as_bytes());
    k.push(b':');
    k
}

#[inline]
fn journal_key(pair: &str, sequence: u64) -> Vec<u8> {
    let mut key = prefix(pair);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

#[inline]
fn recorded_key(pair: &str) -> Vec<u8> {
    let mut key = b"recorded:".to_vec();
    key.extend_from_slice(pair.as_bytes());
    key
}

/// ParityDB-backed storage for the journal, snapshots, orders and trades.
///
/// Every column has a B-tree index so it can be scanned in key order.
/// Multi-key writes go through [`Store::commit`], which ParityDB applies atomically.
pub struct Store {
    db: Db,
    /// Serializes read-modify-write updates of single trades.
    trade_cas: Mutex<()>,
}

impl Store {
    /// Open (or create) a ParityDB at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut opts = Options::with_columns(path.as_ref(), COLUMNS);
        // journal writes must be on disk before a submission is acknowledged
        opts.sync_wal = true;
        for column in opts.columns.iter_mut() {
            column.btree_index = true;
        }
        let db = Db::open_or_create(&opts)?;
        Ok(Store {
            db,
            trade_cas: Mutex::new(()),
        })
    }

    pub fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.db.commit(batch.ops)?;
        Ok(())
    }

    /// Scan values of `col` whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, col: ColId, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut it = self.db.iter(col)?;
        if prefix.is_empty() {
            it.seek_to_first()?;
        } else {
            it.seek(prefix)?;
        }
        let mut out = Vec::new();
        while let Some((k, v)) = it.next()? {
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k, v));
        }
        Ok(out)
    }

    // ---- journal ----------------------------------------------------------

    /// Write a journal entry unless one already exists at that sequence.
    ///
    /// Returns `false` when the entry was already present.
    pub fn put_journal_if_absent(
        &self,
        pair: &str,
        sequence: u64,
        raw: Vec<u8>,
    ) -> StoreResult<bool> {
        let key = journal_key(pair, sequence);
        if self.db.get(COL_JOURNAL, &key)?.is_some() {
            return Ok(false);
        }
        self.db.commit(vec![(COL_JOURNAL, key, Some(raw))])?;
        Ok(true)
    }

    /// Raw journal entries of `pair` with sequence `>= from`, ascending.
    pub fn journal_from(&self, pair: &str, from: u64) -> StoreResult<Vec<(u64, Vec<u8>)>> {
        let pfx = prefix(pair);
        let mut it = self.db.iter(COL_JOURNAL)?;
        it.seek(&journal_key(pair, from))?;
        let mut out = Vec::new();
        while let Some((k, v)) = it.next()? {
            if !k.starts_with(&pfx) || k.len() != pfx.len() + 8 {
                break;
            }
            let mut seq = [0u8; 8];
            seq.copy_from_slice(&k[pfx.len()..]);
            out.push((u64::from_be_bytes(seq), v));
        }
        Ok(out)
    }

    // ---- snapshots --------------------------------------------------------

    pub fn put_snapshot(&self, snapshot: &OrderBookSnapshot) -> StoreResult<()> {
        let value = encode(snapshot)?;
        self.db.commit(vec![(
            COL_SNAPSHOTS,
            snapshot.pair.as_bytes().to_vec(),
            Some(value),
        )])?;
        Ok(())
    }

    pub fn latest_snapshot(&self, pair: &str) -> StoreResult<Option<OrderBookSnapshot>> {
        self.db
            .get(COL_SNAPSHOTS, pair.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    // ---- orders -----------------------------------------------------------

    pub fn get_order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        self.db
            .get(COL_ORDERS, order_id.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    pub fn order_exists(&self, order_id: &str) -> StoreResult<bool> {
        Ok(self.db.get(COL_ORDERS, order_id.as_bytes())?.is_some())
    }

    pub fn orders_for_pair(&self, pair: &str) -> StoreResult<Vec<Order>> {
        let mut out = Vec::new();
        for (_, raw) in self.scan_prefix(COL_ORDERS, &[])? {
            let order: Order = decode(&raw)?;
            if order.pair == pair {
                out.push(order);
            }
        }
        Ok(out)
    }

    // ---- trades -----------------------------------------------------------

    pub fn get_trade(&self, trade_id: &str) -> StoreResult<Option<Trade>> {
        self.db
            .get(COL_TRADES, trade_id.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    pub fn trades(&self) -> StoreResult<Vec<Trade>> {
        self.scan_prefix(COL_TRADES, &[])?
            .into_iter()
            .map(|(_, raw)| decode(&raw))
            .collect()
    }

    /// Atomic conditional update of one trade.
    ///
    /// `update` sees the current stored trade and returns the replacement, or
    /// `None` to leave it unchanged. No other `update_trade` call can interleave
    /// between the read and the write.
    pub fn update_trade<F>(&self, trade_id: &str, update: F) -> StoreResult<Option<Trade>>
    where
        F: FnOnce(&Trade) -> Option<Trade>,
    {
        let _guard = self.trade_cas.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = self.get_trade(trade_id)? else {
            return Ok(None);
        };
        let Some(next) = update(&current) else {
            return Ok(None);
        };
        let mut batch = WriteBatch::new();
        batch.put_trade(&next)?;
        self.commit(batch)?;
        Ok(Some(next))
    }

    // ---- meta -------------------------------------------------------------

    /// Highest sequence whose trades and order updates were committed for `pair`.
    pub fn recorded_sequence(&self, pair: &str) -> StoreResult<u64> {
        Ok(self
            .db
            .get(COL_META, &recorded_key(pair))?
            .and_then(|raw| raw.try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::tests::limit;
    use crate::orders::Side;
    use crate::trade::SettlementStatus;
    use rust_decimal_macros::dec;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn trade(id: &str) -> Trade {
        Trade {
            id: id.into(),
            pair: "MBTC-MUSDT".into(),
            price: dec!(100),
            amount: dec!(1),
            side: Side::Sell,
            maker_order_id: "m".into(),
            taker_order_id: "t".into(),
            maker_identity: "0xmaker".into(),
            taker_identity: "0xtaker".into(),
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

    #[test]
    fn journal_is_write_once_and_ordered() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert!(store.put_journal_if_absent("A-B", 2, vec![2]).unwrap());
        assert!(store.put_journal_if_absent("A-B", 1, vec![1]).unwrap());
        assert!(!store.put_journal_if_absent("A-B", 1, vec![9]).unwrap());
        assert!(store.put_journal_if_absent("A-BC", 1, vec![7]).unwrap());

        let all = store.journal_from("A-B", 1).unwrap();
        assert_eq!(all, vec![(1, vec![1]), (2, vec![2])]);
        let tail = store.journal_from("A-B", 2).unwrap();
        assert_eq!(tail, vec![(2, vec![2])]);
    }

    #[test]
    fn batch_writes_orders_trades_and_watermark_together() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let order = limit("o1", "alice", Side::Buy, dec!(100), dec!(2));
        let mut batch = WriteBatch::new();
        batch.put_order(&order).unwrap();
        batch.put_trade(&trade("t1")).unwrap();
        batch.put_recorded("MBTC-MUSDT", 4);
        store.commit(batch).unwrap();

        assert_eq!(store.get_order("o1").unwrap(), Some(order));
        assert!(store.get_trade("t1").unwrap().is_some());
        assert_eq!(store.recorded_sequence("MBTC-MUSDT").unwrap(), 4);
        assert_eq!(store.recorded_sequence("OTHER-PAIR").unwrap(), 0);
        assert_eq!(store.orders_for_pair("MBTC-MUSDT").unwrap().len(), 1);
    }

    #[test]
    fn update_trade_is_conditional() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut batch = WriteBatch::new();
        batch.put_trade(&trade("t1")).unwrap();
        store.commit(batch).unwrap();

        let claimed = store
            .update_trade("t1", |t| {
                (t.settlement_status == SettlementStatus::Pending).then(|| {
                    let mut next = t.clone();
                    next.settlement_status = SettlementStatus::Settling;
                    next
                })
            })
            .unwrap();
        assert!(claimed.is_some());

        let again = store
            .update_trade("t1", |t| {
                (t.settlement_status == SettlementStatus::Pending).then(|| t.clone())
            })
            .unwrap();
        assert!(again.is_none());
        assert!(store.update_trade("missing", |t| Some(t.clone())).unwrap().is_none());
    }
}
