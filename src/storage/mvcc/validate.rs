use super::iterator::{merge, Entry};
use super::{IterationTracker, Lookup, MultiVersionStore, Read, TxIndex};
use crate::errdata;
use crate::error::Result;
use crate::storage::debug::{format_raw, format_set};
use crate::storage::Engine;

use crossbeam::channel::{Receiver, Sender};
use log::debug;
use std::collections::BTreeSet;

impl<E: Engine> MultiVersionStore<E> {
    /// Validates the latest executed attempt of a transaction against the
    /// current state of all lower transactions. Returns whether the attempt is
    /// still valid, and the indices of lower transactions whose estimates it
    /// depends on. If conflicts are returned, the verdict is not final: the
    /// transaction should be validated again once those have re-executed.
    pub fn validate_transaction_state(&self, index: TxIndex) -> Result<(bool, BTreeSet<TxIndex>)> {
        let mut conflicts = BTreeSet::new();
        let mut valid = self.validate_readset(index, &mut conflicts)?;
        if valid {
            valid = self.validate_iterateset(index, &mut conflicts)?;
        }
        if !valid {
            debug!("Txn {index} invalid, conflicts {}", format_set(&conflicts));
        }
        Ok((valid, conflicts))
    }

    /// Checks that every key in the read set would still read the same value.
    fn validate_readset(&self, index: TxIndex, conflicts: &mut BTreeSet<TxIndex>) -> Result<bool> {
        let Some(readset) = self.get_readset(index) else {
            return Ok(true);
        };
        let mut valid = true;
        for (key, observed) in readset {
            // Inconsistent reads of the same key.
            let [expect] = observed.as_slice() else {
                debug!("Txn {index} read {} {} times", format_raw(&key), observed.len());
                valid = false;
                continue;
            };
            match self.read_before_index(index, &key)? {
                Read::Estimate(writer) => {
                    conflicts.insert(writer);
                    valid = false;
                }
                Read::Value(value) if &value != expect => valid = false,
                Read::Value(_) => {}
            }
        }
        Ok(valid)
    }

    /// Checks that every iteration in the iterate set would still yield the
    /// same key/value pairs. The iterations are replayed in order on a
    /// background thread, which stops at the first mismatch or estimate and
    /// reports a verdict on a done channel or the estimate's writer on an
    /// abort channel.
    fn validate_iterateset(
        &self,
        index: TxIndex,
        conflicts: &mut BTreeSet<TxIndex>,
    ) -> Result<bool> {
        let Some(iterateset) = self.get_iterateset(index) else {
            return Ok(true);
        };
        if iterateset.is_empty() {
            return Ok(true);
        }
        std::thread::scope(|s| {
            let (done_tx, done_rx) = crossbeam::channel::bounded(1);
            let (abort_tx, abort_rx) = crossbeam::channel::bounded(1);
            std::thread::Builder::new().name(format!("validate-{index}")).spawn_scoped(
                s,
                move || {
                    let result = self.replay_iterations(index, &iterateset, &abort_tx);
                    // Nothing is waiting if validation already returned.
                    let _ = done_tx.try_send(result);
                },
            )?;

            match Self::await_iteration(&done_rx, &abort_rx)? {
                Verdict::Valid => Ok(true),
                Verdict::Invalid => Ok(false),
                Verdict::Conflict(writer) => {
                    conflicts.insert(writer);
                    Ok(false)
                }
            }
        })
    }

    /// Waits for the iteration replays to report back. An abort takes
    /// priority.
    fn await_iteration(
        done_rx: &Receiver<Result<bool>>,
        abort_rx: &Receiver<TxIndex>,
    ) -> Result<Verdict> {
        crossbeam::select! {
            recv(abort_rx) -> writer => match writer {
                Ok(writer) => Ok(Verdict::Conflict(writer)),
                Err(_) => Self::await_done(done_rx),
            },
            recv(done_rx) -> result => match result {
                Ok(result) => match abort_rx.try_recv() {
                    Ok(writer) => Ok(Verdict::Conflict(writer)),
                    Err(_) => Ok(if result? { Verdict::Valid } else { Verdict::Invalid }),
                },
                Err(_) => match abort_rx.try_recv() {
                    Ok(writer) => Ok(Verdict::Conflict(writer)),
                    Err(_) => errdata!("iterator validation exited without a verdict"),
                },
            },
        }
    }

    fn await_done(done_rx: &Receiver<Result<bool>>) -> Result<Verdict> {
        match done_rx.recv() {
            Ok(result) => Ok(if result? { Verdict::Valid } else { Verdict::Invalid }),
            Err(_) => errdata!("iterator validation exited without a verdict"),
        }
    }

    /// Replays iterations in order, stopping at the first one that no longer
    /// matches.
    fn replay_iterations(
        &self,
        index: TxIndex,
        iterateset: &[IterationTracker],
        abort_tx: &Sender<TxIndex>,
    ) -> Result<bool> {
        for tracker in iterateset {
            if !self.replay_iteration(index, tracker, abort_tx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replays an iteration as the transaction would see it now, comparing the
    /// yielded key/value pairs with the recorded ones. Estimates are sent on
    /// the abort channel, and yield false.
    fn replay_iteration(
        &self,
        index: TxIndex,
        tracker: &IterationTracker,
        abort_tx: &Sender<TxIndex>,
    ) -> Result<bool> {
        let abort = |writer: TxIndex| {
            let _ = abort_tx.try_send(writer);
            Ok(false)
        };
        let entries = merge(self, index, &tracker.writes, &tracker.range(), tracker.reverse)?;
        let mut entries = entries.into_iter().filter(|(_, entry)| !matches!(entry, Entry::Deleted));

        for (expect_key, expect_value) in &tracker.items {
            let Some((key, entry)) = entries.next() else {
                return Ok(false);
            };
            let value = match entry {
                Entry::Estimate(writer) => return abort(writer),
                // The snapshot may race with a concurrent removal or rewrite
                // of the version, so resolve it again. A version that is now
                // gone means the key set changed.
                Entry::Version(..) => match self.lookup_before_index(index, &key) {
                    Lookup::Value(_, value) => value,
                    Lookup::Estimate(writer) => return abort(writer),
                    Lookup::Absent | Lookup::Deleted(_) => return Ok(false),
                },
                Entry::Value(value) => value,
                Entry::Deleted => continue,
            };
            if key != *expect_key || value != *expect_value {
                return Ok(false);
            }
        }

        // An exhausted iterator must not see any new keys at the end.
        if tracker.exhausted {
            return match entries.next() {
                None => Ok(true),
                Some((_, Entry::Estimate(writer))) => abort(writer),
                Some(_) => Ok(false),
            };
        }
        Ok(true)
    }
}

/// The outcome of replaying an iteration.
enum Verdict {
    Valid,
    Invalid,
    Conflict(TxIndex),
}

#[cfg(test)]
mod tests {
    use super::super::{View, WriteSet};
    use super::*;
    use crate::storage::Memory;

    use parking_lot::RwLock;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn setup() -> Arc<MultiVersionStore<Memory>> {
        let engine: Memory =
            [b"a", b"c"].into_iter().map(|k| (k.to_vec(), b"engine".to_vec())).collect();
        Arc::new(MultiVersionStore::new(Arc::new(RwLock::new(engine))))
    }

    fn write(store: &MultiVersionStore<Memory>, index: TxIndex, writes: &[(&str, Option<&str>)]) {
        let writeset: WriteSet = writes
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.map(|v| v.as_bytes().to_vec())))
            .collect();
        store.set_writeset(index, 0, &writeset);
    }

    /// Executes an attempt with the given closure, and publishes it.
    fn execute(
        store: &Arc<MultiVersionStore<Memory>>,
        index: TxIndex,
        f: impl FnOnce(&mut View<Memory>) -> Result<()>,
    ) -> Result<()> {
        let (tx, _rx) = crossbeam::channel::bounded(1);
        let mut view = View::new(index, 0, store.clone(), tx);
        f(&mut view)?;
        view.write_to_multiversion_store();
        Ok(())
    }

    #[test]
    fn readset() -> Result<()> {
        let store = setup();
        write(&store, 0, &[("k", Some("0"))]);
        execute(&store, 2, |v| {
            v.get(b"a")?;
            v.get(b"k")?;
            v.get(b"missing")?;
            Ok(())
        })?;
        assert_eq!(store.validate_transaction_state(2)?, (true, BTreeSet::new()));

        // Writes by higher transactions don't matter.
        write(&store, 3, &[("a", Some("3")), ("missing", Some("3"))]);
        assert_eq!(store.validate_transaction_state(2)?, (true, BTreeSet::new()));

        // A lower write of the same value is still valid.
        write(&store, 1, &[("a", Some("engine"))]);
        assert_eq!(store.validate_transaction_state(2)?, (true, BTreeSet::new()));

        // A changed value isn't.
        write(&store, 1, &[("missing", Some("1"))]);
        assert_eq!(store.validate_transaction_state(2)?, (false, BTreeSet::new()));

        // An estimate is reported as a conflict.
        store.invalidate_writeset(1, 0);
        assert_eq!(store.validate_transaction_state(2)?, (false, BTreeSet::from([1])));
        Ok(())
    }

    #[test]
    fn inconsistent_reads() -> Result<()> {
        let store = setup();
        store.set_readset(1, [(b"a".to_vec(), vec![None, Some(b"engine".to_vec())])].into());
        assert_eq!(store.validate_transaction_state(1)?, (false, BTreeSet::new()));
        Ok(())
    }

    #[test]
    fn removed_version() -> Result<()> {
        // Txn 1 reads k1 written by txn 0, then txn 0 re-executes without
        // writing k1. The version is gone, and txn 1 must be invalid.
        let store = setup();
        write(&store, 0, &[("k1", Some("v")), ("k2", Some("v"))]);
        execute(&store, 1, |v| {
            assert_eq!(v.get(b"k1")?, Some(b"v".to_vec()));
            Ok(())
        })?;
        assert_eq!(store.validate_transaction_state(1)?, (true, BTreeSet::new()));

        store.set_writeset(0, 1, &WriteSet::from([(b"k2".to_vec(), Some(b"v".to_vec()))]));
        assert_eq!(store.get_latest_before_index(1, b"k1"), None);
        assert_eq!(store.validate_transaction_state(1)?, (false, BTreeSet::new()));
        Ok(())
    }

    #[test]
    fn iterateset() -> Result<()> {
        let store = setup();
        write(&store, 0, &[("b", Some("0"))]);
        execute(&store, 2, |v| {
            v.set(b"d", b"own".to_vec());
            assert_eq!(v.iterator(..)?.count(), 4);
            Ok(())
        })?;
        assert_eq!(store.validate_transaction_state(2)?, (true, BTreeSet::new()));

        // Writing the same value is still valid.
        write(&store, 1, &[("c", Some("engine"))]);
        assert_eq!(store.validate_transaction_state(2)?, (true, BTreeSet::new()));

        // Changing a value isn't, even though the key set is the same.
        write(&store, 1, &[("c", Some("1"))]);
        assert_eq!(store.validate_transaction_state(2)?, (false, BTreeSet::new()));

        // Inserting a key does.
        write(&store, 1, &[("c", Some("1")), ("bb", Some("1"))]);
        assert_eq!(store.validate_transaction_state(2)?, (false, BTreeSet::new()));

        // So does deleting one.
        write(&store, 1, &[("a", None)]);
        assert_eq!(store.validate_transaction_state(2)?, (false, BTreeSet::new()));

        // Adding a key beyond the end of an exhausted iterator does too.
        write(&store, 1, &[("e", Some("1"))]);
        assert_eq!(store.validate_transaction_state(2)?, (false, BTreeSet::new()));

        // Estimates are conflicts.
        write(&store, 1, &[]);
        assert_eq!(store.validate_transaction_state(2)?, (true, BTreeSet::new()));
        store.set_estimated_writeset(0, 1, &WriteSet::from([(b"b".to_vec(), None)]));
        assert_eq!(store.validate_transaction_state(2)?, (false, BTreeSet::from([0])));
        Ok(())
    }

    #[test]
    fn changed_iteration_value() -> Result<()> {
        // Txn 1 sums b..=c, reading b from txn 0 and c from the engine.
        let store = setup();
        write(&store, 0, &[("b", Some("0"))]);
        execute(&store, 1, |v| {
            let items: Vec<_> = v.iterator(b"b".to_vec()..=b"c".to_vec())?.collect::<Result<_>>()?;
            assert_eq!(items.len(), 2);
            Ok(())
        })?;
        assert_eq!(store.validate_transaction_state(1)?, (true, BTreeSet::new()));

        // Txn 0 re-executes with a new value for b.
        store.set_writeset(0, 1, &WriteSet::from([(b"b".to_vec(), Some(b"5".to_vec()))]));
        assert_eq!(store.validate_transaction_state(1)?, (false, BTreeSet::new()));
        Ok(())
    }

    #[test]
    fn many_iterations() -> Result<()> {
        // Every iteration is replayed on the same background thread.
        let store = setup();
        write(&store, 0, &[("b", Some("0"))]);
        execute(&store, 1, |v| {
            for _ in 0..5000 {
                assert_eq!(v.iterator(..)?.count(), 3);
            }
            Ok(())
        })?;
        assert_eq!(store.get_iterateset(1).map(|i| i.len()), Some(5000));
        assert_eq!(store.validate_transaction_state(1)?, (true, BTreeSet::new()));

        store.set_estimated_writeset(0, 1, &WriteSet::from([(b"b".to_vec(), None)]));
        assert_eq!(store.validate_transaction_state(1)?, (false, BTreeSet::from([0])));
        Ok(())
    }

    #[test]
    fn partial_iteration() -> Result<()> {
        let store = setup();
        execute(&store, 2, |v| {
            let mut iter = v.reverse_iterator(..)?;
            assert_eq!(iter.next().transpose()?.map(|(k, _)| k), Some(b"c".to_vec()));
            Ok(())
        })?;
        assert_eq!(store.validate_transaction_state(2)?, (true, BTreeSet::new()));

        // Keys past the point where iteration stopped don't matter.
        write(&store, 0, &[("a", None), ("b", Some("0"))]);
        assert_eq!(store.validate_transaction_state(2)?, (true, BTreeSet::new()));

        // Keys before it do.
        write(&store, 1, &[("d", Some("1"))]);
        assert_eq!(store.validate_transaction_state(2)?, (false, BTreeSet::new()));
        Ok(())
    }
}
