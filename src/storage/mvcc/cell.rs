use super::{Incarnation, TxIndex};

use std::collections::BTreeMap;

/// A version of a key, as returned by a VersionedCell lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionItem {
    /// The index of the transaction that wrote the version.
    pub index: TxIndex,
    /// The incarnation of the writing transaction.
    pub incarnation: Incarnation,
    /// The value. None for deletions and estimates.
    pub value: Option<Vec<u8>>,
    /// If true, the writer has been invalidated and the value isn't known yet.
    pub estimate: bool,
}

impl VersionItem {
    /// Returns true if the version is a deletion marker.
    pub fn is_deleted(&self) -> bool {
        !self.estimate && self.value.is_none()
    }
}

/// A single version entry, keyed by writer index in the cell.
#[derive(Clone, Debug, PartialEq)]
struct Version {
    incarnation: Incarnation,
    value: Option<Vec<u8>>,
    estimate: bool,
}

/// The version chain of a single key: at most one version per writing
/// transaction, ordered by transaction index.
///
/// Cells have no internal synchronization. They live inside the shards of the
/// multi-version store's concurrent map, and are only read or mutated while
/// holding the shard lock, which linearizes all operations on a key. Lookups
/// return owned items, so no reference into a cell outlives the lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VersionedCell {
    versions: BTreeMap<TxIndex, Version>,
}

impl VersionedCell {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value written by the given transaction, replacing any
    /// previous version at that index. None is a deletion. Writes from an
    /// older incarnation than the stored one are ignored, returning false.
    pub fn set(
        &mut self,
        index: TxIndex,
        incarnation: Incarnation,
        value: Option<Vec<u8>>,
    ) -> bool {
        self.insert(index, Version { incarnation, value, estimate: false })
    }

    /// Marks the given transaction's version as an estimate.
    pub fn set_estimate(&mut self, index: TxIndex, incarnation: Incarnation) -> bool {
        self.insert(index, Version { incarnation, value: None, estimate: true })
    }

    fn insert(&mut self, index: TxIndex, version: Version) -> bool {
        match self.versions.get(&index) {
            Some(existing) if existing.incarnation > version.incarnation => false,
            _ => {
                self.versions.insert(index, version);
                true
            }
        }
    }

    /// Returns the version written by exactly the given transaction, if any.
    pub fn get(&self, index: TxIndex) -> Option<VersionItem> {
        self.versions.get(&index).map(|v| Self::item(index, v))
    }

    /// Returns the version with the highest index, if any.
    pub fn latest(&self) -> Option<VersionItem> {
        self.versions.iter().next_back().map(|(i, v)| Self::item(*i, v))
    }

    /// Returns the version with the highest index strictly below the given
    /// index, or None if there is no such version (in which case the reader
    /// must fall back to the backing engine).
    pub fn latest_before(&self, index: TxIndex) -> Option<VersionItem> {
        self.versions.range(..index).next_back().map(|(i, v)| Self::item(*i, v))
    }

    /// Removes the version written by the given transaction. Returns false
    /// if there was none, which is not an error: a retried transaction may
    /// remove a version that a concurrent cleanup already removed.
    pub fn remove(&mut self, index: TxIndex) -> bool {
        self.versions.remove(&index).is_some()
    }

    /// Returns true if the cell has no versions, and can be pruned.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Returns the number of versions in the cell.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    fn item(index: TxIndex, version: &Version) -> VersionItem {
        VersionItem {
            index,
            incarnation: version.incarnation,
            value: version.value.clone(),
            estimate: version.estimate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn item(index: TxIndex, incarnation: Incarnation, value: Option<&[u8]>) -> VersionItem {
        VersionItem { index, incarnation, value: value.map(|v| v.to_vec()), estimate: false }
    }

    #[test]
    fn latest_before() {
        let mut cell = VersionedCell::new();
        assert_eq!(cell.latest(), None);
        assert_eq!(cell.latest_before(10), None);

        cell.set(2, 0, Some(b"two".to_vec()));
        cell.set(5, 0, None);
        cell.set(7, 1, Some(b"seven".to_vec()));

        assert_eq!(cell.latest_before(0), None);
        assert_eq!(cell.latest_before(2), None);
        assert_eq!(cell.latest_before(3), Some(item(2, 0, Some(b"two"))));
        assert_eq!(cell.latest_before(5), Some(item(2, 0, Some(b"two"))));
        assert_eq!(cell.latest_before(6), Some(item(5, 0, None)));
        assert!(cell.latest_before(6).unwrap().is_deleted());
        assert_eq!(cell.latest_before(100), Some(item(7, 1, Some(b"seven"))));
        assert_eq!(cell.latest(), Some(item(7, 1, Some(b"seven"))));
        assert_eq!(cell.get(5), Some(item(5, 0, None)));
        assert_eq!(cell.get(6), None);
    }

    #[test]
    fn set_replaces_same_index() {
        let mut cell = VersionedCell::new();
        assert!(cell.set(1, 0, Some(vec![1])));
        assert!(cell.set(1, 1, Some(vec![2])));
        assert_eq!(cell.len(), 1);
        assert_eq!(cell.latest(), Some(item(1, 1, Some(&[2]))));

        // A stale incarnation can't overwrite a newer one.
        assert!(!cell.set(1, 0, Some(vec![3])));
        assert_eq!(cell.latest(), Some(item(1, 1, Some(&[2]))));
    }

    #[test]
    fn set_is_idempotent() {
        let mut once = VersionedCell::new();
        once.set(3, 2, Some(vec![7]));

        let mut twice = VersionedCell::new();
        twice.set(3, 2, Some(vec![7]));
        twice.set(3, 2, Some(vec![7]));

        assert_eq!(once, twice);
    }

    #[test]
    fn estimate() {
        let mut cell = VersionedCell::new();
        cell.set(1, 0, Some(vec![1]));
        assert!(cell.set_estimate(1, 0));

        let latest = cell.latest_before(2).unwrap();
        assert!(latest.estimate);
        assert!(!latest.is_deleted());
        assert_eq!(latest.value, None);

        // The next incarnation replaces the estimate.
        cell.set(1, 1, Some(vec![2]));
        assert_eq!(cell.latest_before(2), Some(item(1, 1, Some(&[2]))));
    }

    #[test]
    fn remove() {
        let mut cell = VersionedCell::new();
        cell.set(1, 0, Some(vec![1]));
        cell.set(2, 0, Some(vec![2]));

        assert!(cell.remove(2));
        assert!(!cell.remove(2));
        assert_eq!(cell.latest_before(3), Some(item(1, 0, Some(&[1]))));
        assert!(!cell.is_empty());

        assert!(cell.remove(1));
        assert!(cell.is_empty());
        assert_eq!(cell.latest_before(3), None);
    }
}
