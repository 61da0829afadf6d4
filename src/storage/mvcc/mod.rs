//! This module implements a multi-version key/value store for optimistic
//! concurrent execution of an ordered batch of transactions (a block). It
//! allows the transactions to execute speculatively in parallel, while the
//! committed result is identical to executing them one at a time in order.
//!
//! VERSIONS
//! ========
//!
//! Every transaction in a batch has a fixed index, its position in the batch,
//! and an incarnation, the number of times it has been re-executed. When an
//! execution attempt finishes, its writes are published to the store as
//! versions tagged with (index, incarnation):
//!
//! ```text
//! Key   Txn 0   Txn 1   Txn 2   Txn 3
//! a     a=1             a=2
//! b             b=x     ?
//! c     ✗
//! ```
//!
//! A transaction reads the version written by the closest lower index, e.g.
//! txn 3 reads a=2 while txn 1 reads a=1, and falls back to the backing engine
//! when no lower index wrote the key. Higher indices are never visible, so a
//! transaction observes exactly the state sequential execution would give it,
//! provided the lower transactions' writes are final.
//!
//! A ✗ is a deletion marker, which hides the backing engine's value. A ? is an
//! estimate: a write by a transaction that has been invalidated and will be
//! re-executed, so the value is not yet known. A transaction that reads an
//! estimate aborts immediately, since anything it computes from here on is
//! likely wasted work, and is retried later.
//!
//! READ SETS AND VALIDATION
//! ========================
//!
//! While executing, a transaction's View records every value it read (its
//! read set) and every key range it iterated over along with the key/value
//! pairs it saw (its iterate set). Writes are buffered in the view and only
//! published when the attempt completes.
//!
//! Once executed, a transaction is validated: for every key in its read set,
//! the value that would be read now must equal the value read during
//! execution, and re-running every iteration must yield the same key/value
//! pairs. If a lower transaction has since written a different value (or
//! re-executed and no longer writes the key at all), the transaction is
//! invalid, its writes are converted to estimates, and it is re-executed with
//! a new incarnation.
//!
//! When every transaction validates, the highest version of every key is
//! written to the backing engine, committing the batch.

mod cell;
mod iterator;
mod store;
mod validate;
mod view;

pub use cell::{VersionItem, VersionedCell};
pub use iterator::{IterationTracker, ViewIterator};
pub use store::{Lookup, MultiVersionStore, Read};
pub use view::{Abort, View};

use std::collections::{BTreeMap, HashMap};

/// A transaction's position in the batch.
pub type TxIndex = usize;

/// The execution attempt number of a transaction, starting at 0.
pub type Incarnation = usize;

/// The buffered writes of an execution attempt. None is a deletion. Ordered,
/// so that iterators can merge it with the store and the backing engine.
pub type WriteSet = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// The values observed by an execution attempt for each key it read, in the
/// order they were read. None means the key did not exist. An attempt that
/// observed a key more than once with different values saw inconsistent
/// state, and is always invalid.
pub type ReadSet = HashMap<Vec<u8>, Vec<Option<Vec<u8>>>>;

/// The iterations performed by an execution attempt.
pub type IterateSet = Vec<IterationTracker>;
