pub mod mem;

use crate::{
    comparator::Comparator,
    serde::{Deserializable, DeserializeError, Serializable, SerializeError},
    value::{InternalKey, InternalValue, RangeTombstone, SeqNo, UserKey},
    FileNum,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    cmp::Ordering,
    io::{Read, Write},
    sync::Arc,
};

/// Immutable descriptor of a sorted table
///
/// Tables are named by a monotone file number. Bounds are internal keys;
/// the seqno window is used by the L0 ordering rules. A table produced
/// by ingest has `smallest_seqno == largest_seqno`.
#[derive(Clone, PartialEq, Eq)]
pub struct TableMeta {
    /// Monotone file number
    pub file_num: FileNum,

    /// File size in bytes
    pub size: u64,

    /// Smallest internal key in the table
    pub smallest: InternalKey,

    /// Largest internal key in the table
    pub largest: InternalKey,

    /// Lowest seqno of any entry
    pub smallest_seqno: SeqNo,

    /// Highest seqno of any entry
    pub largest_seqno: SeqNo,
}

impl std::fmt::Debug for TableMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:[{}-{}]",
            crate::file::fmt_file_num(self.file_num),
            self.smallest,
            self.largest
        )
    }
}

impl TableMeta {
    /// Whether this table was created by an atomic ingest
    ///
    /// Ingested tables get a single seqno assigned to the whole file.
    #[must_use]
    pub fn is_ingested(&self) -> bool {
        self.smallest_seqno == self.largest_seqno
    }

    /// Whether the table's user-key span intersects `[lo, hi]` (closed)
    #[must_use]
    pub fn overlaps_range(&self, cmp: &dyn Comparator, lo: &[u8], hi: &[u8]) -> bool {
        cmp.compare(&self.smallest.user_key, hi) != Ordering::Greater
            && cmp.compare(&self.largest.user_key, lo) != Ordering::Less
    }
}

impl Serializable for TableMeta {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        writer.write_u64::<BigEndian>(self.file_num)?;
        writer.write_u64::<BigEndian>(self.size)?;
        self.smallest.serialize(writer)?;
        self.largest.serialize(writer)?;
        writer.write_u64::<BigEndian>(self.smallest_seqno)?;
        writer.write_u64::<BigEndian>(self.largest_seqno)?;
        Ok(())
    }
}

impl Deserializable for TableMeta {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        Ok(Self {
            file_num: reader.read_u64::<BigEndian>()?,
            size: reader.read_u64::<BigEndian>()?,
            smallest: InternalKey::deserialize(reader)?,
            largest: InternalKey::deserialize(reader)?,
            smallest_seqno: reader.read_u64::<BigEndian>()?,
            largest_seqno: reader.read_u64::<BigEndian>()?,
        })
    }
}

/// Sorts tables of a sorted run by their smallest key
pub fn sort_by_smallest(files: &mut [Arc<TableMeta>], cmp: &dyn Comparator) {
    files.sort_by(|a, b| {
        cmp.compare(&a.smallest.user_key, &b.smallest.user_key)
            .then_with(|| a.smallest.cmp(&b.smallest))
    });
}

/// Combined smallest/largest internal keys over both input slices
///
/// Returns `None` if both slices are empty.
pub fn key_range(inputs: [&[Arc<TableMeta>]; 2]) -> Option<(InternalKey, InternalKey)> {
    let mut smallest: Option<InternalKey> = None;
    let mut largest: Option<InternalKey> = None;

    for f in inputs.into_iter().flatten() {
        match &mut smallest {
            Some(sm) if f.smallest < *sm => *sm = f.smallest.clone(),
            Some(_) => {}
            None => smallest = Some(f.smallest.clone()),
        }
        match &mut largest {
            Some(la) if f.largest > *la => *la = f.largest.clone(),
            Some(_) => {}
            None => largest = Some(f.largest.clone()),
        }
    }

    Some((smallest?, largest?))
}

/// Iterator over a table's point entries, in internal order
pub type BoxedTableIter = Box<dyn Iterator<Item = crate::Result<InternalValue>> + Send>;

/// Accepts internal keys in strictly non-decreasing internal order and
/// produces a sorted table with recorded bounds
pub trait TableWriter: Send {
    /// Appends an entry
    fn add(&mut self, item: InternalValue) -> crate::Result<()>;

    /// Records a range tombstone
    fn add_range_tombstone(&mut self, tombstone: RangeTombstone) -> crate::Result<()>;

    /// Approximate size of data written so far
    fn estimated_size(&self) -> u64;

    /// Amount of point entries written so far
    fn item_count(&self) -> usize;

    /// Seals the table and returns its metadata
    fn finish(self: Box<Self>) -> crate::Result<Arc<TableMeta>>;

    /// Discards the partially written table
    fn abandon(self: Box<Self>) -> crate::Result<()>;
}

/// Access to sorted tables; the on-disk format is the embedder's business
pub trait TableProvider: Send + Sync {
    /// Starts a new table with the given file number
    fn create(&self, file_num: FileNum) -> crate::Result<Box<dyn TableWriter>>;

    /// Iterates the table's point entries, optionally bounded to `[lo, hi)`
    /// in user-key space
    fn iter(
        &self,
        meta: &TableMeta,
        bounds: Option<(UserKey, UserKey)>,
    ) -> crate::Result<BoxedTableIter>;

    /// Returns the table's range tombstones
    fn range_tombstones(&self, meta: &TableMeta) -> crate::Result<Vec<RangeTombstone>>;

    /// Drops the table
    ///
    /// Tables referenced by a live version or an in-progress compaction
    /// must never be passed here.
    fn remove(&self, file_num: FileNum) -> crate::Result<()>;
}
