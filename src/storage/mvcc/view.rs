use super::{
    Incarnation, IterateSet, IterationTracker, MultiVersionStore, Read, ReadSet, TxIndex,
    ViewIterator, WriteSet,
};
use crate::error::{Error, Result};
use crate::storage::debug::format_writeset;
use crate::storage::Engine;

use crossbeam::channel::Sender;
use log::debug;
use std::ops::RangeBounds;
use std::sync::Arc;

/// An abort signal, sent by a view when its attempt reads an estimate: the
/// transaction at index must stop and be retried once the transaction at
/// dependency has re-executed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Abort {
    pub index: TxIndex,
    pub dependency: TxIndex,
}

/// The view of the key/value state handed to a single execution attempt.
///
/// Reads see the attempt's own buffered writes, then the latest versions
/// written by lower transactions, then the backing engine. Writes are
/// buffered until the attempt completes and the scheduler publishes them via
/// write_to_multiversion_store(). Every read and iteration is recorded for
/// validation.
pub struct View<E: Engine> {
    index: TxIndex,
    incarnation: Incarnation,
    store: Arc<MultiVersionStore<E>>,
    writeset: WriteSet,
    readset: ReadSet,
    iterateset: IterateSet,
    /// Sends an abort to the owning task. Capacity 1, only the first abort of
    /// an attempt matters.
    abort_tx: Sender<Abort>,
}

impl<E: Engine> View<E> {
    /// Creates a view for an execution attempt.
    pub fn new(
        index: TxIndex,
        incarnation: Incarnation,
        store: Arc<MultiVersionStore<E>>,
        abort_tx: Sender<Abort>,
    ) -> Self {
        Self {
            index,
            incarnation,
            store,
            writeset: WriteSet::new(),
            readset: ReadSet::new(),
            iterateset: IterateSet::new(),
            abort_tx,
        }
    }

    /// Returns the transaction index.
    pub fn index(&self) -> TxIndex {
        self.index
    }

    /// Returns the attempt's incarnation.
    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    /// Returns the multi-version store.
    pub fn store(&self) -> &Arc<MultiVersionStore<E>> {
        &self.store
    }

    /// Returns the buffered writes.
    pub fn writeset(&self) -> &WriteSet {
        &self.writeset
    }

    /// Returns the recorded reads.
    pub fn readset(&self) -> &ReadSet {
        &self.readset
    }

    /// Returns the recorded iterations.
    pub fn iterateset(&self) -> &IterateSet {
        &self.iterateset
    }

    /// Fetches a key's value, or None if it does not exist. Errors with
    /// Error::Abort if the value depends on an estimate, after signalling the
    /// owning task.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.writeset.get(key) {
            return Ok(value.clone());
        }
        let value = match self.store.read_before_index(self.index, key)? {
            Read::Value(value) => value,
            Read::Estimate(writer) => return Err(self.abort(writer)),
        };
        // Only record a changed observation, a repeated read of the same value
        // doesn't make the attempt inconsistent.
        let observed = self.readset.entry(key.to_vec()).or_default();
        if observed.last() != Some(&value) {
            observed.push(value.clone());
        }
        Ok(value)
    }

    /// Returns true if the key exists.
    pub fn has(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Buffers a write.
    pub fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.writeset.insert(key.to_vec(), Some(value));
    }

    /// Buffers a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.writeset.insert(key.to_vec(), None);
    }

    /// Iterates over a key range in ascending key order.
    pub fn iterator(&mut self, range: impl RangeBounds<Vec<u8>>) -> Result<ViewIterator<'_, E>> {
        ViewIterator::new(self, range, false)
    }

    /// Iterates over a key range in descending key order.
    pub fn reverse_iterator(
        &mut self,
        range: impl RangeBounds<Vec<u8>>,
    ) -> Result<ViewIterator<'_, E>> {
        ViewIterator::new(self, range, true)
    }

    /// Discards all buffered writes, e.g. when the transaction failed. Reads
    /// are kept, since the failure still depends on them.
    pub fn discard_writes(&mut self) {
        self.writeset.clear();
    }

    /// Publishes the attempt's writes, reads and iterations to the store.
    pub fn write_to_multiversion_store(self) {
        debug!("Txn {}.{} wrote {}", self.index, self.incarnation, format_writeset(&self.writeset));
        self.store.set_writeset(self.index, self.incarnation, &self.writeset);
        self.store.set_readset(self.index, self.readset);
        self.store.set_iterateset(self.index, self.iterateset);
    }

    /// Publishes the attempt's writes as estimates, after it aborted. Its
    /// reads and iterations are meaningless and are cleared.
    pub fn write_estimates_to_multiversion_store(self) {
        self.store.set_estimated_writeset(self.index, self.incarnation, &self.writeset);
        self.store.clear_readset(self.index);
        self.store.clear_iterateset(self.index);
    }

    /// Signals the owning task that the attempt must abort, and returns the
    /// error to propagate.
    pub(super) fn abort(&self, writer: TxIndex) -> Error {
        debug!("Txn {}.{} read estimate by txn {writer}", self.index, self.incarnation);
        // A full channel means an abort was already signalled.
        let _ = self.abort_tx.try_send(Abort { index: self.index, dependency: writer });
        Error::Abort(writer)
    }

    pub(super) fn record_iteration(&mut self, tracker: IterationTracker) {
        debug!(
            "Txn {}.{} iterated {} keys (exhausted={})",
            self.index,
            self.incarnation,
            tracker.items.len(),
            tracker.exhausted
        );
        self.iterateset.push(tracker);
    }
}
