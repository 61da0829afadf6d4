//! Storage debug helpers, primarily formatting of keys, values and versions
//! for log messages and errors.

use super::mvcc::{VersionItem, WriteSet};

use itertools::Itertools as _;
use std::collections::BTreeSet;

/// Formats a raw byte string, either as a UTF-8 string (if valid and
/// printable), otherwise with non-printable bytes escaped.
pub fn format_raw(v: &[u8]) -> String {
    if v.is_empty() {
        return String::from("[]");
    }
    if let Ok(s) = std::str::from_utf8(v) {
        if s.chars().all(|c| !c.is_control()) {
            return format!(r#""{}""#, s);
        }
    }
    let escaped: Vec<u8> = v.iter().copied().flat_map(std::ascii::escape_default).collect();
    format!(r#"b"{}""#, String::from_utf8_lossy(&escaped))
}

/// Formats a BTreeSet.
pub fn format_set<T: Copy + Ord + std::fmt::Display>(set: &BTreeSet<T>) -> String {
    let elements = set.iter().map(|v| v.to_string()).join(",");
    format!("{{{elements}}}")
}

/// Formats a version, e.g. "t3.1=foo", "t3.1=✗" (deleted), or "t3.1=?"
/// (estimate), where 3 is the writer index and 1 its incarnation.
pub fn format_version(item: &VersionItem) -> String {
    let value = match (&item.value, item.estimate) {
        (_, true) => String::from("?"),
        (None, false) => String::from("✗"),
        (Some(value), false) => format_raw(value),
    };
    format!("t{}.{}={}", item.index, item.incarnation, value)
}

/// Formats a write set as "key=value" pairs, with ✗ for deletes.
pub fn format_writeset(writeset: &WriteSet) -> String {
    let writes = writeset
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{}={}", format_raw(key), format_raw(value)),
            None => format!("{}=✗", format_raw(key)),
        })
        .join(" ");
    format!("{{{writes}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn format() {
        assert_eq!(format_raw(b""), "[]");
        assert_eq!(format_raw(b"foo"), r#""foo""#);
        assert_eq!(format_raw(&[0x00, b'a', 0xff]), r#"b"\x00a\xff""#);
        assert_eq!(format_set(&BTreeSet::from([3, 1, 2])), "{1,2,3}");

        let item = VersionItem { index: 3, incarnation: 1, value: None, estimate: true };
        assert_eq!(format_version(&item), "t3.1=?");
        let item = VersionItem { index: 3, incarnation: 1, value: None, estimate: false };
        assert_eq!(format_version(&item), "t3.1=✗");

        let writeset =
            WriteSet::from([(b"a".to_vec(), Some(b"1".to_vec())), (b"b".to_vec(), None)]);
        assert_eq!(format_writeset(&writeset), r#"{"a"="1" "b"=✗}"#);
    }
}
