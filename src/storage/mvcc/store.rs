use super::{Incarnation, IterateSet, ReadSet, TxIndex, VersionItem, VersionedCell, WriteSet};
use crate::errdata;
use crate::error::Result;
use crate::storage::debug::{format_raw, format_version};
use crate::storage::Engine;

use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The result of looking up the latest version of a key before a transaction
/// index. Every read path classifies versions through this, such that a
/// missing version is an explicit case rather than something to dereference.
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup {
    /// No lower transaction wrote the key: defer to the backing engine.
    Absent,
    /// The key was deleted by the given transaction.
    Deleted(TxIndex),
    /// The given transaction's write is an estimate.
    Estimate(TxIndex),
    /// The key was written by the given transaction.
    Value(TxIndex, Vec<u8>),
}

/// The value a transaction would read for a key, after falling back to the
/// backing engine for absent versions.
#[derive(Clone, Debug, PartialEq)]
pub enum Read {
    /// The value, or None if the key does not exist.
    Value(Option<Vec<u8>>),
    /// The value depends on the given transaction, which is not final.
    Estimate(TxIndex),
}

/// A multi-version store for a single batch of transactions. See the module
/// documentation for details.
///
/// Versions are kept in a sharded concurrent map of key -> VersionedCell, so
/// workers only contend when they touch keys in the same shard. Per-attempt
/// state (read sets, iterate sets and written keys) is kept in side tables by
/// transaction index, and is only ever written by the single worker currently
/// owning that transaction.
pub struct MultiVersionStore<E: Engine> {
    /// The backing engine, holding committed state. Only read during a batch.
    engine: Arc<RwLock<E>>,
    /// Version chains by key.
    cells: DashMap<Vec<u8>, VersionedCell>,
    /// The keys written by each transaction's latest published attempt.
    writeset_keys: DashMap<TxIndex, Vec<Vec<u8>>>,
    /// The read set of each transaction's latest executed attempt.
    readsets: DashMap<TxIndex, ReadSet>,
    /// The iterate set of each transaction's latest executed attempt.
    iteratesets: DashMap<TxIndex, IterateSet>,
    /// Set once the latest versions have been written to the engine.
    written: AtomicBool,
}

impl<E: Engine> MultiVersionStore<E> {
    /// Creates a new, empty multi-version store on top of the given engine.
    pub fn new(engine: Arc<RwLock<E>>) -> Self {
        Self {
            engine,
            cells: DashMap::new(),
            writeset_keys: DashMap::new(),
            readsets: DashMap::new(),
            iteratesets: DashMap::new(),
            written: AtomicBool::new(false),
        }
    }

    /// Returns the backing engine.
    pub fn engine(&self) -> &Arc<RwLock<E>> {
        &self.engine
    }

    /// Returns the latest version of a key, regardless of writer.
    pub fn get_latest(&self, key: &[u8]) -> Option<VersionItem> {
        self.cells.get(key).and_then(|cell| cell.latest())
    }

    /// Returns the latest version of a key written by a transaction with an
    /// index strictly below the given index. Returns None both when the key
    /// has no versions and when none are below the index; callers must then
    /// read the backing engine. Prefer lookup_before_index() or
    /// read_before_index(), which make that case explicit.
    pub fn get_latest_before_index(&self, index: TxIndex, key: &[u8]) -> Option<VersionItem> {
        self.cells.get(key).and_then(|cell| cell.latest_before(index))
    }

    /// Looks up the latest version of a key before the given index, and
    /// classifies it.
    pub fn lookup_before_index(&self, index: TxIndex, key: &[u8]) -> Lookup {
        let Some(item) = self.get_latest_before_index(index, key) else {
            return Lookup::Absent;
        };
        match item {
            VersionItem { index, estimate: true, .. } => Lookup::Estimate(index),
            VersionItem { index, value: None, .. } => Lookup::Deleted(index),
            VersionItem { index, value: Some(value), .. } => Lookup::Value(index, value),
        }
    }

    /// Returns the value the given transaction would read for a key, falling
    /// back to the backing engine if no lower transaction wrote it.
    pub fn read_before_index(&self, index: TxIndex, key: &[u8]) -> Result<Read> {
        Ok(match self.lookup_before_index(index, key) {
            Lookup::Absent => Read::Value(self.engine.read().get(key)?),
            Lookup::Deleted(_) => Read::Value(None),
            Lookup::Estimate(writer) => Read::Estimate(writer),
            Lookup::Value(_, value) => Read::Value(Some(value)),
        })
    }

    /// Returns true if any transaction below the given index wrote the key.
    pub fn has(&self, index: TxIndex, key: &[u8]) -> bool {
        self.get_latest_before_index(index, key).is_some()
    }

    /// Publishes the writes of a completed execution attempt, replacing the
    /// transaction's previous versions. Keys written by a previous
    /// incarnation but not by this one are removed.
    pub fn set_writeset(&self, index: TxIndex, incarnation: Incarnation, writeset: &WriteSet) {
        self.remove_old_writeset(index, writeset);
        for (key, value) in writeset {
            self.cells.entry(key.clone()).or_default().set(index, incarnation, value.clone());
        }
        self.writeset_keys.insert(index, writeset.keys().cloned().collect());
    }

    /// Publishes estimates for a transaction whose attempt aborted, to signal
    /// that it will write these keys but the values aren't known. The aborted
    /// attempt's writes are partial, so keys written by a previous incarnation
    /// are kept as estimates too, rather than removed as in set_writeset().
    pub fn set_estimated_writeset(
        &self,
        index: TxIndex,
        incarnation: Incarnation,
        writeset: &WriteSet,
    ) {
        let mut keys: BTreeSet<Vec<u8>> = self
            .writeset_keys
            .get(&index)
            .map(|k| k.value().iter().cloned().collect())
            .unwrap_or_default();
        keys.extend(writeset.keys().cloned());
        for key in &keys {
            self.cells.entry(key.clone()).or_default().set_estimate(index, incarnation);
        }
        self.writeset_keys.insert(index, keys.into_iter().collect());
    }

    /// Converts all of a transaction's current versions into estimates. Used
    /// when a transaction fails validation and will be re-executed, such that
    /// higher transactions reading its writes abort instead of computing
    /// with values that are likely to change.
    pub fn invalidate_writeset(&self, index: TxIndex, incarnation: Incarnation) {
        let keys = self.writeset_keys.get(&index).map(|k| k.value().clone()).unwrap_or_default();
        for key in keys {
            if let Some(mut cell) = self.cells.get_mut(&key) {
                cell.set_estimate(index, incarnation);
            }
        }
    }

    /// Removes the transaction's versions for keys it previously wrote that
    /// are not in the new write set. Versions written by other transactions
    /// are never touched. Cells left without versions are pruned.
    ///
    /// A concurrent validation may have snapshotted one of these keys before
    /// the removal. It will find the version gone when resolving it, which it
    /// treats as a conflict.
    pub fn remove_old_writeset(&self, index: TxIndex, writeset: &WriteSet) {
        let Some(old) = self.writeset_keys.get(&index).map(|k| k.value().clone()) else {
            return;
        };
        for key in old.iter().filter(|k| !writeset.contains_key(*k)) {
            debug!("Removing stale version of {} by txn {index}", format_raw(key));
            self.cells.remove_if_mut(key, |_, cell| {
                cell.remove(index);
                cell.is_empty()
            });
        }
    }

    /// Returns the writes currently published by the given transaction,
    /// excluding estimates.
    pub fn get_writeset(&self, index: TxIndex) -> WriteSet {
        let keys = self.writeset_keys.get(&index).map(|k| k.value().clone()).unwrap_or_default();
        keys.into_iter()
            .filter_map(|key| {
                let item = self.cells.get(&key)?.get(index)?;
                (!item.estimate).then_some((key, item.value))
            })
            .collect()
    }

    /// Returns the keys written by every transaction that published writes.
    pub fn get_all_writeset_keys(&self) -> BTreeMap<TxIndex, Vec<Vec<u8>>> {
        self.writeset_keys.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }

    /// Stores the read set of a transaction's executed attempt.
    pub fn set_readset(&self, index: TxIndex, readset: ReadSet) {
        self.readsets.insert(index, readset);
    }

    /// Returns the read set of a transaction's executed attempt.
    pub fn get_readset(&self, index: TxIndex) -> Option<ReadSet> {
        self.readsets.get(&index).map(|r| r.value().clone())
    }

    /// Removes the read set of a transaction.
    pub fn clear_readset(&self, index: TxIndex) {
        self.readsets.remove(&index);
    }

    /// Stores the iterate set of a transaction's executed attempt.
    pub fn set_iterateset(&self, index: TxIndex, iterateset: IterateSet) {
        self.iteratesets.insert(index, iterateset);
    }

    /// Returns the iterate set of a transaction's executed attempt.
    pub fn get_iterateset(&self, index: TxIndex) -> Option<IterateSet> {
        self.iteratesets.get(&index).map(|i| i.value().clone())
    }

    /// Removes the iterate set of a transaction.
    pub fn clear_iterateset(&self, index: TxIndex) {
        self.iteratesets.remove(&index);
    }

    /// Returns a snapshot of the latest version before the given index for
    /// every key that has one, including deletions and estimates.
    pub fn collect_iterator_items(&self, index: TxIndex) -> BTreeMap<Vec<u8>, VersionItem> {
        self.collect_iterator_items_in(index, &(..))
    }

    /// Like collect_iterator_items(), but only for keys in the given range.
    pub fn collect_iterator_items_in(
        &self,
        index: TxIndex,
        range: &impl RangeBounds<Vec<u8>>,
    ) -> BTreeMap<Vec<u8>, VersionItem> {
        let mut items = BTreeMap::new();
        for entry in self.cells.iter() {
            if !range.contains(entry.key()) {
                continue;
            }
            if let Some(item) = entry.value().latest_before(index) {
                items.insert(entry.key().clone(), item);
            }
        }
        items
    }

    /// Writes the latest version of every key to the backing engine and
    /// flushes it, committing the batch. Must only be called once every
    /// transaction has been validated, and only once: a second call errors.
    /// Errors without writing anything if any latest version is an estimate.
    pub fn write_latest_to_store(&self) -> Result<()> {
        if self.written.swap(true, Ordering::SeqCst) {
            return errdata!("multiversion store already written to engine");
        }
        let mut latest = BTreeMap::new();
        for entry in self.cells.iter() {
            if let Some(item) = entry.value().latest() {
                latest.insert(entry.key().clone(), item);
            }
        }
        if let Some((key, item)) = latest.iter().find(|(_, item)| item.estimate) {
            let (version, key) = (format_version(item), format_raw(key));
            return errdata!("can't commit estimate {version} for key {key}");
        }

        let mut engine = self.engine.write();
        for (key, item) in latest {
            match item.value {
                Some(value) => engine.set(&key, value)?,
                None => engine.delete(&key)?,
            }
        }
        engine.flush()
    }
}
