use crate::serde::{Deserializable, DeserializeError, Serializable, SerializeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    cmp::Reverse,
    io::{Read, Write},
    sync::Arc,
};

/// User defined key
pub type UserKey = Arc<[u8]>;

/// User defined data (blob of bytes)
pub type UserValue = Arc<[u8]>;

/// Sequence number, a monotonically increasing counter
///
/// A value with a higher sequence number shadows an item with the
/// same key and lower sequence number. This enables MVCC.
///
/// Shadowed items are lazily garbage-collected during compaction.
pub type SeqNo = u64;

/// Highest sequence number that fits into a key trailer (56 bits)
pub const SEQNO_MAX: SeqNo = (1 << 56) - 1;

/// Kind of a key-value entry
///
/// The discriminant doubles as the disk representation and as the
/// tie-break for entries sharing a sequence number (higher kind first).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// Deleted value
    Delete = 0,

    /// Existing value
    Set = 1,

    /// Partial value, combined with older entries by the merge operator
    Merge = 2,

    /// Deletes exactly one older `Set` of the same key
    SingleDelete = 3,

    /// Deletes a range of user keys; the entry's value holds the
    /// exclusive end key
    RangeDelete = 4,
}

impl ValueKind {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "DEL" => Self::Delete,
            "SET" => Self::Set,
            "MERGE" => Self::Merge,
            "SINGLEDEL" => Self::SingleDelete,
            "RANGEDEL" => Self::RangeDelete,
            _ => return None,
        })
    }

    fn abbrev(self) -> &'static str {
        match self {
            Self::Delete => "DEL",
            Self::Set => "SET",
            Self::Merge => "MERGE",
            Self::SingleDelete => "SINGLEDEL",
            Self::RangeDelete => "RANGEDEL",
        }
    }
}

impl TryFrom<u8> for ValueKind {
    type Error = DeserializeError;

    fn try_from(value: u8) -> Result<Self, DeserializeError> {
        match value {
            0 => Ok(Self::Delete),
            1 => Ok(Self::Set),
            2 => Ok(Self::Merge),
            3 => Ok(Self::SingleDelete),
            4 => Ok(Self::RangeDelete),
            tag => Err(DeserializeError::InvalidTag(tag)),
        }
    }
}

impl From<ValueKind> for u8 {
    fn from(value: ValueKind) -> Self {
        value as Self
    }
}

/// A user key qualified by a sequence number and entry kind
///
/// All ordering and versioning in the tree happens on this type:
/// user key ascending, then sequence number descending, then kind
/// descending, so that newer versions of a key precede older ones.
#[derive(Clone, PartialEq, Eq)]
pub struct InternalKey {
    /// User-defined key - an arbitrary byte array
    pub user_key: UserKey,

    /// Sequence number of the write
    pub seqno: SeqNo,

    /// Entry kind
    pub kind: ValueKind,
}

impl InternalKey {
    /// Creates a new [`InternalKey`].
    ///
    /// # Panics
    ///
    /// Panics if the sequence number does not fit into 56 bits.
    pub fn new<K: Into<UserKey>>(user_key: K, seqno: SeqNo, kind: ValueKind) -> Self {
        assert!(seqno <= SEQNO_MAX, "seqno is limited to 56 bits");

        Self {
            user_key: user_key.into(),
            seqno,
            kind,
        }
    }

    /// Whether the key marks a deletion of some kind
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::Delete | ValueKind::SingleDelete | ValueKind::RangeDelete
        )
    }

    /// Parses a key from its `user.KIND.seqno` test notation, e.g. `b.SET.15`.
    ///
    /// # Panics
    ///
    /// Panics on malformed input. Only meant for fixtures.
    #[doc(hidden)]
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let mut parts = s.rsplitn(3, '.');
        let seqno = parts
            .next()
            .and_then(|x| x.parse::<SeqNo>().ok())
            .expect("should have a seqno");
        let kind = parts
            .next()
            .and_then(ValueKind::parse)
            .expect("should have a kind");
        let user_key = parts.next().expect("should have a user key");

        Self::new(user_key.as_bytes(), seqno, kind)
    }
}

impl std::fmt::Display for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{},{}",
            String::from_utf8_lossy(&self.user_key),
            self.seqno,
            self.kind.abbrev()
        )
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by user key, THEN by sequence number and kind, both reversed.
// This is one of the most important functions: it puts the freshest
// version of a key first, which queries and compactions rely on.
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.seqno), Reverse(u8::from(self.kind))).cmp(&(
            &other.user_key,
            Reverse(other.seqno),
            Reverse(u8::from(other.kind)),
        ))
    }
}

impl Serializable for InternalKey {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.user_key.len() as u16)?;
        writer.write_all(&self.user_key)?;

        // Fixed trailer, matching the on-disk key suffix
        writer.write_u64::<BigEndian>((self.seqno << 8) | u64::from(u8::from(self.kind)))?;

        Ok(())
    }
}

impl Deserializable for InternalKey {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let key_len = reader.read_u16::<BigEndian>()?;
        let mut user_key = vec![0; key_len.into()];
        reader.read_exact(&mut user_key)?;

        let trailer = reader.read_u64::<BigEndian>()?;
        let kind = ValueKind::try_from((trailer & 0xFF) as u8)?;

        Ok(Self {
            user_key: user_key.into(),
            seqno: trailer >> 8,
            kind,
        })
    }
}

/// Represents a single entry in the LSM-tree
#[derive(Clone, PartialEq, Eq)]
pub struct InternalValue {
    /// Qualified key
    pub key: InternalKey,

    /// User-defined value - an arbitrary byte array
    ///
    /// For a range delete, holds the exclusive end key of the deleted span
    pub value: UserValue,
}

impl InternalValue {
    /// Creates a new entry.
    ///
    /// # Panics
    ///
    /// Panics if the sequence number does not fit into 56 bits.
    pub fn new<K: Into<UserKey>, V: Into<UserValue>>(
        user_key: K,
        value: V,
        seqno: SeqNo,
        kind: ValueKind,
    ) -> Self {
        Self {
            key: InternalKey::new(user_key, seqno, kind),
            value: value.into(),
        }
    }

    /// Pairs an existing key with a value
    pub fn from_key(key: InternalKey, value: UserValue) -> Self {
        Self { key, value }
    }

    /// Approximate in-memory size
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.user_key.len() + self.value.len()
    }
}

impl std::fmt::Debug for InternalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} => {:?}", self.key, self.value)
    }
}

impl PartialOrd for InternalValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// A tombstone covering the user keys in `[start, end)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeTombstone {
    /// First deleted user key (inclusive)
    pub start: UserKey,

    /// End of the deleted span (exclusive)
    pub end: UserKey,

    /// Sequence number of the deletion
    pub seqno: SeqNo,
}

impl RangeTombstone {
    /// Creates a new range tombstone over `[start, end)`
    pub fn new<S: Into<UserKey>, E: Into<UserKey>>(start: S, end: E, seqno: SeqNo) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            seqno,
        }
    }

    /// Whether the tombstone covers `key` as seen by a read at `seqno`
    #[must_use]
    pub fn covers(&self, key: &[u8], seqno: SeqNo) -> bool {
        self.seqno < seqno && &*self.start <= key && key < &*self.end
    }
}

/// Returns the least user key strictly greater than `key`
pub(crate) fn ukey_successor(key: &[u8]) -> UserKey {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0);
    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_ordering() {
        let a = InternalKey::parse("a.SET.5");
        let b = InternalKey::parse("a.SET.3");
        let c = InternalKey::parse("b.SET.9");

        assert!(a < b, "newer version should sort first");
        assert!(b < c, "user key dominates seqno");
    }

    #[test]
    fn key_kind_tiebreak() {
        // At the same seqno, higher kinds sort first
        let del = InternalKey::parse("a.DEL.5");
        let set = InternalKey::parse("a.SET.5");
        assert!(set < del);
    }

    #[test]
    fn key_roundtrip() -> crate::Result<()> {
        let key = InternalKey::parse("hello.MERGE.44");

        let mut bytes = Vec::new();
        key.serialize(&mut bytes)?;

        let read = InternalKey::deserialize(&mut &bytes[..])?;
        assert_eq!(key, read);

        Ok(())
    }

    #[test]
    fn key_format() {
        assert_eq!("b#15,SET", InternalKey::parse("b.SET.15").to_string());
    }

    #[test]
    fn range_tombstone_covers() {
        let t = RangeTombstone::new(*b"c", *b"f", 10);

        assert!(t.covers(b"c", 11));
        assert!(t.covers(b"e", 11));
        assert!(!t.covers(b"f", 11), "end is exclusive");
        assert!(!t.covers(b"c", 10), "not visible at its own seqno");
    }
}
