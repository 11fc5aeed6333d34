use super::{BoxedTableIter, TableMeta, TableProvider, TableWriter};
use crate::{
    value::{InternalKey, InternalValue, RangeTombstone, SeqNo, UserKey, ValueKind},
    Error, FileNum,
};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Sorted table contents, shared with in-flight iterators
struct TableData {
    items: Vec<InternalValue>,
    range_tombstones: Vec<RangeTombstone>,
}

/// Table provider that keeps tables on the heap
///
/// Stands in for the external sorted-table format; handy for tests and
/// for embedders that bring their own persistence.
#[derive(Default)]
pub struct MemTables {
    tables: Arc<RwLock<HashMap<FileNum, Arc<TableData>>>>,
}

impl MemTables {
    /// Creates an empty provider
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Amount of live tables
    pub fn len(&self) -> usize {
        self.tables.read().expect("lock is poisoned").len()
    }

    /// Whether no tables are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, file_num: FileNum) -> crate::Result<Arc<TableData>> {
        self.tables
            .read()
            .expect("lock is poisoned")
            .get(&file_num)
            .cloned()
            .ok_or(Error::TableMissing(file_num))
    }
}

impl TableProvider for MemTables {
    fn create(&self, file_num: FileNum) -> crate::Result<Box<dyn TableWriter>> {
        Ok(Box::new(MemTableWriter {
            tables: self.tables.clone(),
            file_num,
            items: Vec::new(),
            range_tombstones: Vec::new(),
            size: 0,
        }))
    }

    fn iter(
        &self,
        meta: &TableMeta,
        bounds: Option<(UserKey, UserKey)>,
    ) -> crate::Result<BoxedTableIter> {
        let data = self.get(meta.file_num)?;

        let (start, end) = match bounds {
            Some((lo, hi)) => {
                let start = data.items.partition_point(|x| *x.key.user_key < *lo);
                let end = data.items.partition_point(|x| *x.key.user_key < *hi);
                (start, end)
            }
            None => (0, data.items.len()),
        };

        Ok(Box::new(MemTableIter {
            data,
            pos: start,
            end,
        }))
    }

    fn range_tombstones(&self, meta: &TableMeta) -> crate::Result<Vec<RangeTombstone>> {
        Ok(self.get(meta.file_num)?.range_tombstones.clone())
    }

    fn remove(&self, file_num: FileNum) -> crate::Result<()> {
        // In-flight iterators keep the data alive through their Arc
        self.tables
            .write()
            .expect("lock is poisoned")
            .remove(&file_num);
        Ok(())
    }
}

struct MemTableIter {
    data: Arc<TableData>,
    pos: usize,
    end: usize,
}

impl Iterator for MemTableIter {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let item = self.data.items[self.pos].clone();
        self.pos += 1;
        Some(Ok(item))
    }
}

struct MemTableWriter {
    tables: Arc<RwLock<HashMap<FileNum, Arc<TableData>>>>,
    file_num: FileNum,
    items: Vec<InternalValue>,
    range_tombstones: Vec<RangeTombstone>,
    size: u64,
}

impl TableWriter for MemTableWriter {
    fn add(&mut self, item: InternalValue) -> crate::Result<()> {
        debug_assert!(
            self.items.last().map_or(true, |prev| prev.key < item.key),
            "items must arrive in ascending internal order"
        );

        self.size += item.size() as u64;
        self.items.push(item);
        Ok(())
    }

    fn add_range_tombstone(&mut self, tombstone: RangeTombstone) -> crate::Result<()> {
        self.size += (tombstone.start.len() + tombstone.end.len() + 8) as u64;
        self.range_tombstones.push(tombstone);
        Ok(())
    }

    fn estimated_size(&self) -> u64 {
        self.size
    }

    fn item_count(&self) -> usize {
        self.items.len()
    }

    fn finish(self: Box<Self>) -> crate::Result<Arc<TableMeta>> {
        debug_assert!(
            !self.items.is_empty() || !self.range_tombstones.is_empty(),
            "refusing to write an empty table"
        );

        let mut smallest: Option<InternalKey> = None;
        let mut largest: Option<InternalKey> = None;
        let mut smallest_seqno = SeqNo::MAX;
        let mut largest_seqno = 0;

        let mut update = |key: InternalKey| {
            match &mut smallest {
                Some(sm) if key < *sm => *sm = key.clone(),
                Some(_) => {}
                None => smallest = Some(key.clone()),
            }
            match &mut largest {
                Some(la) if key > *la => *la = key,
                Some(_) => {}
                None => largest = Some(key),
            }
        };

        for item in &self.items {
            smallest_seqno = smallest_seqno.min(item.key.seqno);
            largest_seqno = largest_seqno.max(item.key.seqno);
            update(item.key.clone());
        }

        for t in &self.range_tombstones {
            smallest_seqno = smallest_seqno.min(t.seqno);
            largest_seqno = largest_seqno.max(t.seqno);
            update(InternalKey::new(t.start.clone(), t.seqno, ValueKind::RangeDelete));
            update(InternalKey::new(t.end.clone(), 0, ValueKind::RangeDelete));
        }

        let meta = Arc::new(TableMeta {
            file_num: self.file_num,
            size: self.size,
            smallest: smallest.expect("table should not be empty"),
            largest: largest.expect("table should not be empty"),
            smallest_seqno,
            largest_seqno,
        });

        self.tables.write().expect("lock is poisoned").insert(
            self.file_num,
            Arc::new(TableData {
                items: self.items,
                range_tombstones: self.range_tombstones,
            }),
        );

        Ok(meta)
    }

    fn abandon(self: Box<Self>) -> crate::Result<()> {
        Ok(())
    }
}
