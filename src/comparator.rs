use crate::value::InternalKey;
use std::cmp::Ordering;

/// User-key ordering, pluggable by the embedder
///
/// The comparator is fixed for the lifetime of a store. Its name is
/// recorded in the manifest; opening a store with a different comparator
/// is a fatal error.
///
/// The in-memory structures (memtable, merge heap) order keys bytewise,
/// so a custom comparator must be consistent with bytewise ordering.
pub trait Comparator: Send + Sync {
    /// Name recorded in the manifest
    fn name(&self) -> &'static str;

    /// Compares two user keys
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte-slice ordering, the default
#[derive(Copy, Clone, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "scree.bytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Internal-key ordering on top of a user-key comparator
///
/// User key ascending, then seqno descending, then kind descending.
pub fn compare_internal(cmp: &dyn Comparator, a: &InternalKey, b: &InternalKey) -> Ordering {
    cmp.compare(&a.user_key, &b.user_key)
        .then_with(|| b.seqno.cmp(&a.seqno))
        .then_with(|| u8::from(b.kind).cmp(&u8::from(a.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueKind;
    use test_log::test;

    #[test]
    fn bytewise() {
        let cmp = BytewiseComparator;

        assert_eq!(Ordering::Less, cmp.compare(b"a", b"b"));
        assert_eq!(Ordering::Equal, cmp.compare(b"abc", b"abc"));
        assert_eq!(Ordering::Greater, cmp.compare(b"abc", b"ab"));
    }

    #[test]
    fn internal_ordering() {
        let cmp = BytewiseComparator;

        let newer = InternalKey::new(*b"a", 5, ValueKind::Set);
        let older = InternalKey::new(*b"a", 3, ValueKind::Set);
        assert_eq!(Ordering::Less, compare_internal(&cmp, &newer, &older));

        let del = InternalKey::new(*b"a", 5, ValueKind::Delete);
        assert_eq!(Ordering::Less, compare_internal(&cmp, &newer, &del));
    }
}
