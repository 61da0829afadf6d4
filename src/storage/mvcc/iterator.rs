use super::{MultiVersionStore, TxIndex, View};
use crate::error::Result;
use crate::storage::Engine;

use std::ops::{Bound, RangeBounds};

/// A record of one iteration performed by an execution attempt: the range and
/// direction, the attempt's own buffered writes in that range when the
/// iterator was created, every key/value pair it yielded, and whether it ran
/// to the end.
///
/// Validation re-runs the iteration against the current state of lower
/// transactions and requires the same key/value pairs in the same order. The
/// buffered
/// writes are captured at creation time, since those are the writes the
/// iterator actually merged.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationTracker {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
    pub reverse: bool,
    pub writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    pub items: Vec<(Vec<u8>, Vec<u8>)>,
    pub exhausted: bool,
}

impl IterationTracker {
    /// Returns the tracked range.
    pub fn range(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        (self.start.clone(), self.end.clone())
    }
}

/// A merged entry, as seen by a transaction at some index.
#[derive(Clone, Debug, PartialEq)]
pub(super) enum Entry {
    /// A value from the local write set or the backing engine.
    Value(Vec<u8>),
    /// A value written by the given lower transaction.
    Version(TxIndex, Vec<u8>),
    /// A deletion. Skipped, but shadows lower layers.
    Deleted,
    /// An estimate written by the given lower transaction.
    Estimate(TxIndex),
}

/// Returns false for ranges that BTreeMap would reject: a start after the end,
/// or an equal start and end that are both excluded. These are empty.
pub(super) fn is_valid_range(range: &(Bound<Vec<u8>>, Bound<Vec<u8>>)) -> bool {
    match range {
        (Bound::Excluded(start), Bound::Excluded(end)) => start < end,
        (
            Bound::Included(start) | Bound::Excluded(start),
            Bound::Included(end) | Bound::Excluded(end),
        ) => start <= end,
        _ => true,
    }
}

/// Merges the given local writes, the store's latest versions before index,
/// and the backing engine over a range, in that order of precedence. Returns
/// the entries in iteration order.
pub(super) fn merge<E: Engine>(
    store: &MultiVersionStore<E>,
    index: TxIndex,
    writes: &[(Vec<u8>, Option<Vec<u8>>)],
    range: &(Bound<Vec<u8>>, Bound<Vec<u8>>),
    reverse: bool,
) -> Result<Vec<(Vec<u8>, Entry)>> {
    if !is_valid_range(range) {
        return Ok(Vec::new());
    }
    let mut merged = std::collections::BTreeMap::new();
    {
        let engine = store.engine().read();
        for item in engine.scan_dyn(range.clone()) {
            let (key, value) = item?;
            merged.insert(key, Entry::Value(value));
        }
    }
    for (key, item) in store.collect_iterator_items_in(index, range) {
        let entry = match item.value {
            _ if item.estimate => Entry::Estimate(item.index),
            None => Entry::Deleted,
            Some(value) => Entry::Version(item.index, value),
        };
        merged.insert(key, entry);
    }
    for (key, value) in writes {
        let entry = value.clone().map(Entry::Value).unwrap_or(Entry::Deleted);
        merged.insert(key.clone(), entry);
    }
    let mut entries: Vec<_> = merged.into_iter().collect();
    if reverse {
        entries.reverse();
    }
    Ok(entries)
}

/// An iterator over a key range as seen by an execution attempt. It is finite
/// and can't be restarted: once it returns None or an error, it is done.
///
/// The merged state is snapshotted when the iterator is created. Yielded items
/// are tracked, and the tracker is recorded in the view's iterate set when the
/// iterator is dropped. The iterator borrows the view mutably, so the attempt
/// can't write while iterating.
pub struct ViewIterator<'a, E: Engine> {
    view: &'a mut View<E>,
    entries: std::vec::IntoIter<(Vec<u8>, Entry)>,
    tracker: Option<IterationTracker>,
    done: bool,
}

impl<'a, E: Engine> ViewIterator<'a, E> {
    pub(super) fn new(
        view: &'a mut View<E>,
        range: impl RangeBounds<Vec<u8>>,
        reverse: bool,
    ) -> Result<Self> {
        let range = (range.start_bound().cloned(), range.end_bound().cloned());
        let writes: Vec<_> = match is_valid_range(&range) {
            true => {
                view.writeset().range(range.clone()).map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            false => Vec::new(),
        };
        let entries = merge(view.store(), view.index(), &writes, &range, reverse)?;
        let (start, end) = range;
        let tracker =
            IterationTracker { start, end, reverse, writes, items: Vec::new(), exhausted: false };
        Ok(Self { view, entries: entries.into_iter(), tracker: Some(tracker), done: false })
    }

    fn try_next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        for (key, entry) in self.entries.by_ref() {
            let value = match entry {
                Entry::Value(value) | Entry::Version(_, value) => value,
                Entry::Deleted => continue,
                Entry::Estimate(writer) => return Err(self.view.abort(writer)),
            };
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.items.push((key.clone(), value.clone()));
            }
            return Ok(Some((key, value)));
        }
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.exhausted = true;
        }
        Ok(None)
    }
}

impl<E: Engine> Iterator for ViewIterator<'_, E> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.try_next().transpose();
        if !matches!(result, Some(Ok(_))) {
            self.done = true;
        }
        result
    }
}

impl<E: Engine> Drop for ViewIterator<'_, E> {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            self.view.record_iteration(tracker);
        }
    }
}
