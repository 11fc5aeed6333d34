use crate::value::{
    InternalKey, InternalValue, RangeTombstone, SeqNo, UserKey, UserValue, ValueKind, SEQNO_MAX,
};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::AtomicU32;

/// The memtable serves as an intermediary storage for new items
#[derive(Default)]
pub struct MemTable {
    pub(crate) items: SkipMap<InternalKey, UserValue>,

    /// Approximate active memtable size
    ///
    /// If this grows too large, a flush is triggered
    pub(crate) approximate_size: AtomicU32,
}

impl MemTable {
    /// Returns the item by key if it exists
    ///
    /// The item with the highest seqno will be returned, if `seqno` is None
    pub fn get<K: AsRef<[u8]>>(&self, key: K, seqno: Option<SeqNo>) -> Option<InternalValue> {
        let prefix = key.as_ref();

        // NOTE: This range start deserves some explanation...
        // Internal keys are multi-sorted by 2 categories: user_key and Reverse(seqno).
        // We search for the lowest entry that is greater or equal the user's prefix key
        // and has the highest seqno (because the seqno is stored in reverse order)
        let range = InternalKey::new(prefix, SEQNO_MAX, ValueKind::RangeDelete)..;

        for entry in self.items.range(range) {
            let key = entry.key();

            // We are past the searched key, so we can immediately return None
            if &*key.user_key > prefix {
                return None;
            }

            if key.kind == ValueKind::RangeDelete {
                continue;
            }

            // Check for seqno if needed
            if let Some(seqno) = seqno {
                if key.seqno < seqno {
                    return Some(InternalValue::from_key(
                        entry.key().clone(),
                        entry.value().clone(),
                    ));
                }
            } else {
                return Some(InternalValue::from_key(
                    entry.key().clone(),
                    entry.value().clone(),
                ));
            }
        }

        None
    }

    /// Get approximate size of memtable in bytes
    pub fn size(&self) -> u32 {
        self.approximate_size
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Count the amount of items in the memtable
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the memtable is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts an item into the memtable
    pub fn insert(&self, item: InternalValue) -> (u32, u32) {
        // NOTE: Value is limited to 32 bits, so the size fits as well
        #[allow(clippy::cast_possible_truncation)]
        let item_size = item.size() as u32;

        let size_before = self
            .approximate_size
            .fetch_add(item_size, std::sync::atomic::Ordering::AcqRel);

        self.items.insert(item.key, item.value);

        (item_size, size_before + item_size)
    }

    /// All point versions of a user key with seqno below `upper`,
    /// newest first
    pub fn get_versions<K: AsRef<[u8]>>(&self, key: K, upper: SeqNo) -> Vec<InternalValue> {
        let prefix = key.as_ref();
        let range = InternalKey::new(prefix, SEQNO_MAX, ValueKind::RangeDelete)..;

        let mut out = Vec::new();

        for entry in self.items.range(range) {
            let key = entry.key();

            if &*key.user_key > prefix {
                break;
            }
            if key.kind == ValueKind::RangeDelete || key.seqno >= upper {
                continue;
            }

            out.push(InternalValue::from_key(key.clone(), entry.value().clone()));
        }

        out
    }

    /// Point entries in internal order, excluding range tombstones
    pub fn point_entries(&self) -> impl Iterator<Item = InternalValue> + '_ {
        self.items
            .iter()
            .filter(|entry| entry.key().kind != ValueKind::RangeDelete)
            .map(|entry| InternalValue::from_key(entry.key().clone(), entry.value().clone()))
    }

    /// All range tombstones buffered in this memtable
    pub fn range_tombstones(&self) -> Vec<RangeTombstone> {
        self.items
            .iter()
            .filter(|entry| entry.key().kind == ValueKind::RangeDelete)
            .map(|entry| RangeTombstone {
                start: entry.key().user_key.clone(),
                end: entry.value().clone(),
                seqno: entry.key().seqno,
            })
            .collect()
    }

    /// Returns the highest sequence number in the memtable
    pub fn get_lsn(&self) -> Option<SeqNo> {
        self.items.iter().map(|x| x.key().seqno).max()
    }

    /// The user-key span of the memtable, if non-empty
    pub fn key_range(&self) -> Option<(UserKey, UserKey)> {
        let mut lo: Option<UserKey> = None;
        let mut hi: Option<UserKey> = None;

        for entry in self.items.iter() {
            let key = entry.key();

            let (start, end) = if key.kind == ValueKind::RangeDelete {
                (key.user_key.clone(), entry.value().clone())
            } else {
                (key.user_key.clone(), key.user_key.clone())
            };

            if lo.as_ref().map_or(true, |x| *start < **x) {
                lo = Some(start);
            }
            if hi.as_ref().map_or(true, |x| *end > **x) {
                hi = Some(end);
            }
        }

        Some((lo?, hi?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_memtable_get() {
        let memtable = MemTable::default();

        let value = InternalValue::new(b"abc".to_vec(), b"abc".to_vec(), 0, ValueKind::Set);

        memtable.insert(value.clone());

        assert_eq!(Some(value), memtable.get("abc", None));
    }

    #[test]
    fn test_memtable_get_highest_seqno() {
        let memtable = MemTable::default();

        for seqno in 0..5 {
            memtable.insert(InternalValue::new(
                b"abc".to_vec(),
                b"abc".to_vec(),
                seqno,
                ValueKind::Set,
            ));
        }

        assert_eq!(
            Some(InternalValue::new(
                b"abc".to_vec(),
                b"abc".to_vec(),
                4,
                ValueKind::Set,
            )),
            memtable.get("abc", None)
        );
    }

    #[test]
    fn test_memtable_get_old_version() {
        let memtable = MemTable::default();

        for seqno in [0, 99, 255] {
            memtable.insert(InternalValue::new(
                b"abc".to_vec(),
                b"abc".to_vec(),
                seqno,
                ValueKind::Set,
            ));
        }

        assert_eq!(
            Some(InternalValue::new(
                b"abc".to_vec(),
                b"abc".to_vec(),
                255,
                ValueKind::Set,
            )),
            memtable.get("abc", None)
        );

        assert_eq!(
            Some(InternalValue::new(
                b"abc".to_vec(),
                b"abc".to_vec(),
                99,
                ValueKind::Set,
            )),
            memtable.get("abc", Some(100))
        );

        assert_eq!(
            Some(InternalValue::new(
                b"abc".to_vec(),
                b"abc".to_vec(),
                0,
                ValueKind::Set,
            )),
            memtable.get("abc", Some(50))
        );
    }

    #[test]
    fn test_range_tombstones_split_out() {
        let memtable = MemTable::default();

        memtable.insert(InternalValue::new(
            b"a".to_vec(),
            b"v".to_vec(),
            1,
            ValueKind::Set,
        ));
        memtable.insert(InternalValue::new(
            b"b".to_vec(),
            b"f".to_vec(),
            2,
            ValueKind::RangeDelete,
        ));

        assert_eq!(1, memtable.point_entries().count());

        let tombstones = memtable.range_tombstones();
        assert_eq!(
            vec![RangeTombstone::new(*b"b", *b"f", 2)],
            tombstones
        );

        let (lo, hi) = memtable.key_range().expect("should be nonempty");
        assert_eq!(b"a".as_slice(), &*lo);
        assert_eq!(b"f".as_slice(), &*hi);
    }
}
